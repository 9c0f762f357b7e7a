use log::trace;

/// State of a per-frame fast index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastIndexState {
    Invalid,
    Building,
    Valid,
}

/// One cached keyblock summary. `count > 0` is a *run count*: the
/// number of consecutive keyblocks (this one included) with equal ebc.
/// `count < 0` is a *cross count*: the negated number of keyblocks to
/// skip from here to reach the next sibling past this keyblock's
/// subordinate nesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastIndexEntry {
    pub ebc: u16,
    pub db: u8,
    pub count: i32,
}

/// Accelerator over a page's keyblock vector. Lets a search skip whole
/// subtrees of the prefix trie, and binary-search the discriminator
/// byte inside an equal-ebc run, without touching the tailblocks.
pub struct FastIndex {
    state: FastIndexState,
    entries: Vec<FastIndexEntry>,
}

impl FastIndex {
    pub fn new() -> FastIndex {
        FastIndex {
            state: FastIndexState::Invalid,
            entries: Vec::new(),
        }
    }

    pub fn state(&self) -> FastIndexState {
        self.state
    }

    pub fn is_valid(&self) -> bool {
        self.state == FastIndexState::Valid
    }

    /// A structural modification drops the index; the next lookup
    /// rebuilds it.
    pub fn invalidate(&mut self) {
        self.state = FastIndexState::Invalid;
        self.entries.clear();
    }

    pub fn entries(&self) -> &[FastIndexEntry] {
        &self.entries
    }

    pub fn count(&self, index: usize) -> i32 {
        self.entries.get(index).map(|e| e.count).unwrap_or(1)
    }

    /// Full rebuild from the keyblock summary `(ebc, db)` per block.
    pub fn rebuild(&mut self, summary: &[(u16, u8)]) {
        self.state = FastIndexState::Building;
        let n = summary.len();

        // sibling[i]: first j > i whose ebc does not exceed ebc[i]
        let mut sibling = vec![n; n];
        let mut stack: Vec<usize> = Vec::new();
        for i in (0..n).rev() {
            while let Some(&top) = stack.last() {
                if summary[top].0 > summary[i].0 {
                    stack.pop();
                } else {
                    break;
                }
            }
            sibling[i] = stack.last().copied().unwrap_or(n);
            stack.push(i);
        }

        let mut entries: Vec<FastIndexEntry> = summary
            .iter()
            .map(|(ebc, db)| FastIndexEntry {
                ebc: *ebc,
                db: *db,
                count: 1,
            })
            .collect();

        for i in (0..n).rev() {
            if i + 1 < n && summary[i + 1].0 > summary[i].0 {
                entries[i].count = -((sibling[i] - i) as i32);
            } else if i + 1 < n && summary[i + 1].0 == summary[i].0 {
                let next = entries[i + 1].count;
                entries[i].count = 1 + if next > 0 { next } else { 1 };
            }
        }

        self.entries = entries;
        self.state = FastIndexState::Valid;
        trace!("fast index rebuilt over {} keyblocks", n);
    }

    /// Patch the index for a single insert at `index`. `summary` is the
    /// keyblock summary *after* the insert.
    ///
    /// - insert at the head of an equal-ebc run extends the run;
    /// - insert in the middle splits/extends it in place;
    /// - insert at the tail extends the preceding run by one;
    /// - an insert nested deeper than both neighbors starts a new
    ///   cross-count chain on its predecessor.
    ///
    /// An insert that reshaped its successor's elision count is a
    /// structural modification; the index is dropped instead.
    pub fn patch_insert(&mut self, index: usize, summary: &[(u16, u8)]) {
        if self.state != FastIndexState::Valid {
            return;
        }
        if self.entries.len() + 1 != summary.len() || index >= summary.len() {
            self.invalidate();
            return;
        }

        // successor reshaped -> rebuild lazily
        if index + 1 < summary.len() {
            let stored = self.entries[index];
            let (succ_ebc, succ_db) = summary[index + 1];
            if stored.ebc != succ_ebc || stored.db != succ_db {
                self.invalidate();
                return;
            }
        }

        let (ebc, db) = summary[index];
        self.entries.insert(
            index,
            FastIndexEntry {
                ebc,
                db,
                count: 1,
            },
        );

        // nestings that now contain one more keyblock
        let mut min_ebc = ebc;
        for j in (0..index).rev() {
            let ej = self.entries[j].ebc;
            if ej < min_ebc {
                let count = self.entries[j].count;
                if count < 0 && j + ((-count) as usize) >= index {
                    self.entries[j].count = count - 1;
                }
                min_ebc = ej;
                if min_ebc == 0 {
                    break;
                }
            }
        }

        self.recompute_block(index);
        if index > 0 && self.entries[index - 1].ebc != ebc {
            // the predecessor may have gained its first child
            self.recompute_block(index - 1);
        }
    }

    /// Recompute run/cross counts for the contiguous equal-ebc block
    /// containing `pos`.
    fn recompute_block(&mut self, pos: usize) {
        let n = self.entries.len();
        let e = self.entries[pos].ebc;

        let mut start = pos;
        while start > 0 && self.entries[start - 1].ebc == e {
            start -= 1;
        }
        let mut end = pos;
        while end + 1 < n && self.entries[end + 1].ebc == e {
            end += 1;
        }

        // only the last block member can own a subordinate nesting
        if end + 1 < n && self.entries[end + 1].ebc > e {
            let mut m = end + 1;
            while m < n && self.entries[m].ebc > e {
                m += 1;
            }
            self.entries[end].count = -((m - end) as i32);
        } else {
            self.entries[end].count = 1;
        }

        for j in (start..end).rev() {
            let next = self.entries[j + 1].count;
            self.entries[j].count = 1 + if next > 0 { next } else { 1 };
        }
    }
}

impl Default for FastIndex {
    fn default() -> FastIndex {
        FastIndex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(index: &FastIndex) -> Vec<i32> {
        index.entries().iter().map(|e| e.count).collect()
    }

    #[test]
    fn rebuild_flat_run() {
        let mut index = FastIndex::new();
        index.rebuild(&[(0, b'a'), (0, b'b'), (0, b'c')]);
        assert!(index.is_valid());
        assert_eq!(counts(&index), vec![3, 2, 1]);
    }

    #[test]
    fn rebuild_nested() {
        // ebcs: 0, 2, 2, 5, 5, 2, 0
        let summary: Vec<(u16, u8)> = vec![
            (0, b'a'),
            (2, b'b'),
            (2, b'c'),
            (5, b'x'),
            (5, b'y'),
            (2, b'd'),
            (0, b'z'),
        ];
        let mut index = FastIndex::new();
        index.rebuild(&summary);

        // entry 0 owns the whole nesting up to entry 6
        assert_eq!(index.count(0), -6);
        // entries 1..=2 are a run, but 2 owns the (5,5) nesting
        assert_eq!(index.count(1), 2);
        assert_eq!(index.count(2), -3);
        assert_eq!(index.count(3), 2);
        assert_eq!(index.count(4), 1);
        assert_eq!(index.count(5), 1);
        assert_eq!(index.count(6), 1);
    }

    #[test]
    fn invalidate_then_rebuild() {
        let mut index = FastIndex::new();
        index.rebuild(&[(0, b'a')]);
        assert!(index.is_valid());
        index.invalidate();
        assert_eq!(index.state(), FastIndexState::Invalid);
        assert_eq!(index.count(0), 1);
    }

    #[test]
    fn patch_tail_extends_run() {
        let mut index = FastIndex::new();
        index.rebuild(&[(0, b'a'), (0, b'b')]);

        let summary = vec![(0, b'a'), (0, b'b'), (0, b'c')];
        index.patch_insert(2, &summary);
        assert!(index.is_valid());

        let mut reference = FastIndex::new();
        reference.rebuild(&summary);
        assert_eq!(counts(&index), counts(&reference));
    }

    #[test]
    fn patch_head_extends_run() {
        let mut index = FastIndex::new();
        index.rebuild(&[(0, b'a'), (2, b'm'), (2, b'n')]);

        // new keyblock at the head of the (2,..) run
        let summary = vec![(0, b'a'), (2, b'k'), (2, b'm'), (2, b'n')];
        index.patch_insert(1, &summary);
        assert!(index.is_valid());

        let mut reference = FastIndex::new();
        reference.rebuild(&summary);
        assert_eq!(counts(&index), counts(&reference));
    }

    #[test]
    fn patch_deeper_insert_starts_cross_chain() {
        let mut index = FastIndex::new();
        index.rebuild(&[(0, b'a'), (0, b'b')]);

        // a logical child of the first key
        let summary = vec![(0, b'a'), (4, b'q'), (0, b'b')];
        index.patch_insert(1, &summary);
        assert!(index.is_valid());

        let mut reference = FastIndex::new();
        reference.rebuild(&summary);
        assert_eq!(counts(&index), counts(&reference));
        assert_eq!(index.count(0), -2);
    }

    #[test]
    fn patch_reshaped_successor_invalidates() {
        let mut index = FastIndex::new();
        index.rebuild(&[(0, b'a'), (0, b'b')]);

        // the successor's summary no longer matches what is cached
        let summary = vec![(0, b'a'), (1, b'z'), (3, b'b')];
        index.patch_insert(1, &summary);
        assert_eq!(index.state(), FastIndexState::Invalid);
    }

    #[test]
    fn patch_matches_rebuild_on_random_shapes() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..50 {
            let n = rng.gen_range(1, 12);
            let mut summary: Vec<(u16, u8)> = Vec::new();
            let mut prev_ebc: u16 = 0;
            for _ in 0..n {
                // an ebc can only nest one step past its predecessor's
                // key, keep shapes plausible
                let ebc = if summary.is_empty() {
                    0
                } else {
                    rng.gen_range(0, prev_ebc + 2)
                };
                summary.push((ebc, rng.gen::<u8>()));
                prev_ebc = ebc;
            }

            // pick an insert point whose successor keeps its summary
            let index = summary.len();
            let ebc = rng.gen_range(0, prev_ebc + 2);
            summary.push((ebc, rng.gen::<u8>()));

            let mut patched = FastIndex::new();
            patched.rebuild(&summary[..index]);
            patched.patch_insert(index, &summary);

            let mut rebuilt = FastIndex::new();
            rebuilt.rebuild(&summary);

            if patched.is_valid() {
                assert_eq!(counts(&patched), counts(&rebuilt), "summary {:?}", summary);
            }
        }
    }
}
