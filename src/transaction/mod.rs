use std::collections::{BTreeMap, HashMap};

use log::{debug, info};

use crate::{
    database::Database,
    journal::records::{InnerRecord, SR_LONG_RECORD},
    key::Key,
    types::{Completion, Timestamp, TreeHandle},
    utils::HandyRwLock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy)]
pub struct TxState {
    pub status: TransactionStatus,
    pub commit_timestamp: Timestamp,
}

/// Transaction status registry, keyed by start timestamp. Given a
/// writer's start timestamp it answers whether (and when) that writer
/// committed; the idea is from PostgreSQL's transaction status data.
#[derive(Default)]
pub struct TransactionRegistry {
    states: HashMap<Timestamp, TxState>,
}

impl TransactionRegistry {
    pub fn new() -> TransactionRegistry {
        TransactionRegistry {
            states: HashMap::new(),
        }
    }

    pub fn begin(&mut self, start: Timestamp) {
        self.states.insert(
            start,
            TxState {
                status: TransactionStatus::Active,
                commit_timestamp: 0,
            },
        );
    }

    pub fn commit(&mut self, start: Timestamp, commit: Timestamp) {
        self.states.insert(
            start,
            TxState {
                status: TransactionStatus::Committed,
                commit_timestamp: commit,
            },
        );
    }

    pub fn abort(&mut self, start: Timestamp) {
        self.states.insert(
            start,
            TxState {
                status: TransactionStatus::Aborted,
                commit_timestamp: 0,
            },
        );
    }

    pub fn state(&self, start: Timestamp) -> Option<TxState> {
        self.states.get(&start).copied()
    }

    /// Drop entries older than the checkpoint; nothing consults them
    /// afterwards.
    pub fn prune(&mut self, through: Timestamp) {
        self.states
            .retain(|start, s| *start > through && s.status != TransactionStatus::Aborted);
    }
}

/// The visibility test: a reader at start timestamp `reader_start`
/// (currently at `reader_step`) sees a record written by the
/// transaction that started at `writer_start` iff that writer
/// committed at or before the reader started, or the record belongs to
/// the reader's own transaction at a step it has already passed.
pub fn is_visible(
    registry: &TransactionRegistry,
    writer_start: Timestamp,
    writer_step: u64,
    reader_start: Timestamp,
    reader_step: u64,
) -> bool {
    if writer_start == reader_start {
        return writer_step <= reader_step;
    }
    match registry.state(writer_start) {
        Some(TxState {
            status: TransactionStatus::Committed,
            commit_timestamp,
        }) => commit_timestamp <= reader_start,
        _ => false,
    }
}

/// What the update buffer knows about a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRead {
    Stored(Vec<u8>),
    Removed,
}

#[derive(Debug, Clone)]
enum PendingOp {
    Store { value: Vec<u8>, step: u64 },
    Remove { step: u64 },
}

#[derive(Debug, Clone)]
struct RangeDelete {
    tree: TreeHandle,
    low: Vec<u8>,
    high: Vec<u8>,
    step: u64,
}

/// A transaction: a start timestamp and a per-session update buffer of
/// pending intents. Cursor operations divert into the buffer while the
/// transaction is active; commit writes one `TX` envelope, forces the
/// journal, then applies the intents to the live trees.
pub struct Transaction {
    start_timestamp: Timestamp,
    step: u64,
    updates: BTreeMap<(TreeHandle, Vec<u8>), PendingOp>,
    range_deletes: Vec<RangeDelete>,
    tree_deletes: Vec<(TreeHandle, u64)>,
}

impl Transaction {
    pub fn new() -> Transaction {
        let start = Database::allocate_timestamp();
        Database::mut_tx_registry().begin(start);
        debug!("transaction {} started", start);
        Transaction {
            start_timestamp: start,
            step: 0,
            updates: BTreeMap::new(),
            range_deletes: Vec::new(),
            tree_deletes: Vec::new(),
        }
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.start_timestamp
    }

    /// Current step number; actions within the transaction are ordered
    /// by it.
    pub fn step(&self) -> u64 {
        self.step
    }

    fn next_step(&mut self) -> u64 {
        self.step += 1;
        self.step
    }

    pub fn record_store(&mut self, tree: TreeHandle, key: &Key, value: &[u8]) {
        let step = self.next_step();
        self.updates.insert(
            (tree, key.encoded().to_vec()),
            PendingOp::Store {
                value: value.to_vec(),
                step,
            },
        );
    }

    pub fn record_remove(&mut self, tree: TreeHandle, key: &Key) {
        let step = self.next_step();
        self.updates
            .insert((tree, key.encoded().to_vec()), PendingOp::Remove { step });
    }

    pub fn record_remove_range(&mut self, tree: TreeHandle, low: &Key, high: &Key) {
        let step = self.next_step();
        self.range_deletes.push(RangeDelete {
            tree,
            low: low.encoded().to_vec(),
            high: high.encoded().to_vec(),
            step,
        });
    }

    pub fn record_remove_tree(&mut self, tree: TreeHandle) {
        let step = self.next_step();
        self.tree_deletes.push((tree, step));
    }

    /// What this transaction's own buffer says about `key`, honoring
    /// step order between exact ops, range deletes and tree deletes.
    pub fn read(&self, tree: TreeHandle, key: &Key) -> Option<PendingRead> {
        let encoded = key.encoded();

        let exact = self.updates.get(&(tree, encoded.to_vec()));
        let exact_step = match exact {
            Some(PendingOp::Store { step, .. }) | Some(PendingOp::Remove { step }) => *step,
            None => 0,
        };

        let range_step = self
            .range_deletes
            .iter()
            .filter(|r| {
                r.tree == tree && r.low.as_slice() <= encoded && encoded < r.high.as_slice()
            })
            .map(|r| r.step)
            .max()
            .unwrap_or(0);

        let tree_step = self
            .tree_deletes
            .iter()
            .filter(|(t, _)| *t == tree)
            .map(|(_, s)| *s)
            .max()
            .unwrap_or(0);

        let covering = range_step.max(tree_step);
        if covering > exact_step {
            return Some(PendingRead::Removed);
        }
        match exact {
            Some(PendingOp::Store { value, .. }) => Some(PendingRead::Stored(value.clone())),
            Some(PendingOp::Remove { .. }) => Some(PendingRead::Removed),
            None if covering > 0 => Some(PendingRead::Removed),
            None => None,
        }
    }

    /// Nearest pending exact-key entry beyond `from` in the given
    /// direction; used to merge the buffer into traversals.
    pub fn next_pending(
        &self,
        tree: TreeHandle,
        from: &[u8],
        forward: bool,
        inclusive: bool,
    ) -> Option<(Vec<u8>, PendingRead)> {
        let candidates = self
            .updates
            .range((tree, Vec::new())..=(tree, vec![0xFFu8; crate::key::MAX_KEY_LENGTH + 1]));

        let mut best: Option<&(TreeHandle, Vec<u8>)> = None;
        for (k, _) in candidates {
            let encoded = k.1.as_slice();
            let beyond = if forward {
                encoded > from || (inclusive && encoded == from)
            } else {
                encoded < from || (inclusive && encoded == from)
            };
            if !beyond {
                continue;
            }
            match best {
                None => best = Some(k),
                Some(b) => {
                    let better = if forward {
                        k.1 < b.1
                    } else {
                        k.1 > b.1
                    };
                    if better {
                        best = Some(k);
                    }
                }
            }
        }

        let key = best?.clone();
        let read = match self.updates.get(&key) {
            Some(PendingOp::Store { value, .. }) => PendingRead::Stored(value.clone()),
            Some(PendingOp::Remove { .. }) => PendingRead::Removed,
            None => return None,
        };
        // a later covering delete still wins
        let k = Key::from_encoded(&key.1);
        match self.read(tree, &k) {
            Some(r) => Some((key.1, r)),
            None => Some((key.1, read)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.range_deletes.is_empty() && self.tree_deletes.is_empty()
    }

    /// Commit protocol:
    /// 1. allocate the commit timestamp;
    /// 2. write long-record chain `PA` records for oversized values;
    /// 3. write the `TX` envelope with every `SR`/`DR`/`DT` intent;
    /// 4. force the journal through the envelope;
    /// 5. apply the intents to the live trees (transactions disabled).
    pub fn commit(self) -> Completion {
        let start = self.start_timestamp;
        if self.is_empty() {
            Database::mut_tx_registry().commit(start, Database::allocate_timestamp());
            return Ok(());
        }

        let commit_ts = Database::allocate_timestamp();
        let ops = self.ordered_ops();
        let mut session = Database::new_session();

        let result = commit_with_session(start, commit_ts, ops, &mut session);
        Database::release_session(&mut session);
        result
    }

    /// Discard the update buffer. Long-record chains are only
    /// allocated at commit, so an abort leaves nothing behind.
    pub fn abort(self) -> Completion {
        Database::mut_tx_registry().abort(self.start_timestamp);
        info!("transaction {} aborted", self.start_timestamp);
        Ok(())
    }
}

fn commit_with_session(
    start: Timestamp,
    commit_ts: Timestamp,
    ops: Vec<OrderedOp>,
    session: &mut crate::tree::Session,
) -> Completion {
    // steps 2 and 3: long-record chains first, then the envelope, so
    // the envelope's descriptors always resolve inside the journal
    let mut inner = Vec::new();
    let mut applies: Vec<ApplyOp> = Vec::new();

    for op in ops {
        match op {
            OrderedOp::Store { tree, key, value, step } => {
                let tree_pod = Database::tree_by_handle(tree)?;
                let volume = Database::volume(tree_pod.rl().volume())?;
                let inline_bound = crate::page::max_inline_value(volume.page_size());

                if value.len() > inline_bound {
                    let descriptor = crate::tree::long_record::write_long_record(
                        session,
                        &volume,
                        &value,
                        commit_ts,
                    )?;
                    let encoded = descriptor.encode().to_vec();
                    inner.extend_from_slice(
                        &InnerRecord::Store {
                            tree,
                            flags: SR_LONG_RECORD,
                            key: key.clone(),
                            value: encoded.clone(),
                            step,
                        }
                        .encode(),
                    );
                    applies.push(ApplyOp::StoreRaw {
                        tree,
                        key,
                        value: encoded,
                        long: true,
                    });
                } else {
                    inner.extend_from_slice(
                        &InnerRecord::Store {
                            tree,
                            flags: 0,
                            key: key.clone(),
                            value: value.clone(),
                            step,
                        }
                        .encode(),
                    );
                    applies.push(ApplyOp::StoreRaw {
                        tree,
                        key,
                        value,
                        long: false,
                    });
                }
            }
            OrderedOp::Remove { tree, key, step } => {
                // a point remove is a delete of the half-open range
                // [key, key + 0x00)
                let mut high = key.clone();
                high.push(0u8);
                inner.extend_from_slice(
                    &InnerRecord::DeleteRange {
                        tree,
                        low: key.clone(),
                        high: high.clone(),
                        step,
                    }
                    .encode(),
                );
                applies.push(ApplyOp::RemoveRange {
                    tree,
                    low: key,
                    high,
                });
            }
            OrderedOp::RemoveRange { tree, low, high, step } => {
                inner.extend_from_slice(
                    &InnerRecord::DeleteRange {
                        tree,
                        low: low.clone(),
                        high: high.clone(),
                        step,
                    }
                    .encode(),
                );
                applies.push(ApplyOp::RemoveRange { tree, low, high });
            }
            OrderedOp::RemoveTree { tree, step } => {
                inner.extend_from_slice(&InnerRecord::DeleteTree { tree, step }.encode());
                applies.push(ApplyOp::RemoveTree { tree });
            }
        }
    }

    {
        let mut journal = Database::mut_journal();
        journal.write_transaction(start, commit_ts, &inner)?;
        journal.force()?;
    }

    // step 4 made the envelope durable: from here on the transaction
    // is committed no matter what the apply pass runs into
    Database::mut_tx_registry().commit(start, commit_ts);

    // step 5: apply the intents to the live trees
    for apply in applies {
        match apply {
            ApplyOp::StoreRaw {
                tree,
                key,
                value,
                long,
            } => {
                let tree_pod = Database::tree_by_handle(tree)?;
                let key = Key::from_encoded(&key);
                let flags = if long {
                    crate::page::page::TB_LONG_RECORD
                } else {
                    0
                };
                crate::tree::store::store_raw(&tree_pod, session, &key, &value, flags)?;
            }
            ApplyOp::RemoveRange { tree, low, high } => {
                let tree_pod = Database::tree_by_handle(tree)?;
                crate::tree::remove::remove_key_range(
                    &tree_pod,
                    session,
                    &Key::from_encoded(&low),
                    &Key::from_encoded(&high),
                )?;
            }
            ApplyOp::RemoveTree { tree } => {
                Database::remove_tree_by_handle(tree, session)?;
            }
        }
    }

    info!("transaction {} committed at {}", start, commit_ts);
    Ok(())
}

impl Transaction {
    fn ordered_ops(&self) -> Vec<OrderedOp> {
        let mut ops: Vec<(u64, OrderedOp)> = Vec::new();
        for ((tree, key), op) in self.updates.iter() {
            match op {
                PendingOp::Store { value, step } => ops.push((
                    *step,
                    OrderedOp::Store {
                        tree: *tree,
                        key: key.clone(),
                        value: value.clone(),
                        step: *step,
                    },
                )),
                PendingOp::Remove { step } => ops.push((
                    *step,
                    OrderedOp::Remove {
                        tree: *tree,
                        key: key.clone(),
                        step: *step,
                    },
                )),
            }
        }
        for r in self.range_deletes.iter() {
            ops.push((
                r.step,
                OrderedOp::RemoveRange {
                    tree: r.tree,
                    low: r.low.clone(),
                    high: r.high.clone(),
                    step: r.step,
                },
            ));
        }
        for (tree, step) in self.tree_deletes.iter() {
            ops.push((
                *step,
                OrderedOp::RemoveTree {
                    tree: *tree,
                    step: *step,
                },
            ));
        }
        ops.sort_by_key(|(step, _)| *step);
        ops.into_iter().map(|(_, op)| op).collect()
    }
}

enum OrderedOp {
    Store {
        tree: TreeHandle,
        key: Vec<u8>,
        value: Vec<u8>,
        step: u64,
    },
    Remove {
        tree: TreeHandle,
        key: Vec<u8>,
        step: u64,
    },
    RemoveRange {
        tree: TreeHandle,
        low: Vec<u8>,
        high: Vec<u8>,
        step: u64,
    },
    RemoveTree {
        tree: TreeHandle,
        step: u64,
    },
}

enum ApplyOp {
    StoreRaw {
        tree: TreeHandle,
        key: Vec<u8>,
        value: Vec<u8>,
        long: bool,
    },
    RemoveRange {
        tree: TreeHandle,
        low: Vec<u8>,
        high: Vec<u8>,
    },
    RemoveTree {
        tree: TreeHandle,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(start: Timestamp) -> Transaction {
        Transaction {
            start_timestamp: start,
            step: 0,
            updates: BTreeMap::new(),
            range_deletes: Vec::new(),
            tree_deletes: Vec::new(),
        }
    }

    #[test]
    fn buffer_read_honors_steps() {
        let mut tx = detached(100);
        let mut k = Key::new();
        k.append(&[5]).unwrap();

        tx.record_store(1, &k, b"v1");
        assert_eq!(tx.read(1, &k), Some(PendingRead::Stored(b"v1".to_vec())));

        // a later range delete covers the earlier store
        let mut low = Key::new();
        low.append(&[0]).unwrap();
        let mut high = Key::new();
        high.append(&[9]).unwrap();
        tx.record_remove_range(1, &low, &high);
        assert_eq!(tx.read(1, &k), Some(PendingRead::Removed));

        // a store after the range delete wins again
        tx.record_store(1, &k, b"v2");
        assert_eq!(tx.read(1, &k), Some(PendingRead::Stored(b"v2".to_vec())));

        // other trees are untouched
        assert_eq!(tx.read(2, &k), None);
    }

    #[test]
    fn next_pending_walks_both_ways() {
        let mut tx = detached(100);
        for b in [3u8, 5, 7].iter() {
            let mut k = Key::new();
            k.append(&[*b]).unwrap();
            tx.record_store(1, &k, &[*b]);
        }

        let from = [4u8, 0].to_vec();
        let (key, read) = tx.next_pending(1, &from, true, false).unwrap();
        assert_eq!(key, vec![5, 0]);
        assert_eq!(read, PendingRead::Stored(vec![5]));

        let (key, _) = tx.next_pending(1, &from, false, false).unwrap();
        assert_eq!(key, vec![3, 0]);

        assert!(tx.next_pending(1, &[8u8, 0], true, false).is_none());
    }

    #[test]
    fn visibility_predicate() {
        let mut registry = TransactionRegistry::new();
        registry.begin(10);
        registry.commit(10, 15);
        registry.begin(20);

        // committed at 15: visible to readers starting at or after 15
        assert!(is_visible(&registry, 10, 1, 15, 0));
        assert!(is_visible(&registry, 10, 1, 30, 0));
        assert!(!is_visible(&registry, 10, 1, 12, 0));

        // live writer: invisible to everyone else
        assert!(!is_visible(&registry, 20, 1, 30, 0));

        // same transaction: step order decides
        assert!(is_visible(&registry, 20, 3, 20, 3));
        assert!(is_visible(&registry, 20, 2, 20, 5));
        assert!(!is_visible(&registry, 20, 7, 20, 5));
    }

    #[test]
    fn registry_prune() {
        let mut registry = TransactionRegistry::new();
        registry.begin(10);
        registry.commit(10, 15);
        registry.begin(20);
        registry.abort(20);
        registry.begin(30);

        registry.prune(25);
        assert!(registry.state(10).is_none());
        assert!(registry.state(20).is_none());
        assert!(registry.state(30).is_some());
    }
}
