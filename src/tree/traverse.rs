use std::sync::Arc;

use super::{get_frame, release_frame, search::search_leaf, Session, Tree};
use crate::{
    buffer::Frame,
    claim::Claim,
    database::Database,
    key::{Direction, Key, KeyFilter, SEGMENT_TERMINATOR, MAX_KEY_LENGTH},
    page::{PageType, Position},
    types::{DbResult, Pod},
    utils::HandyRwLock,
    value::LongRecordDescriptor,
    volume::Volume,
};

/// Find the next key from `key` in the requested direction and load
/// its value (honoring `min_bytes` for long records). On success the
/// key is updated in place; `None` means there is no such key — the
/// traversal never wraps around an edge.
///
/// `deep` descends into logical children; otherwise only keys of the
/// same logical depth as the starting key are reported, and reaching a
/// shallower key ends the traversal. A `KeyFilter` restricts the
/// result set; its `next` steers the search across excluded spans.
pub fn traverse(
    tree: &Pod<Tree>,
    session: &mut Session,
    key: &mut Key,
    direction: Direction,
    deep: bool,
    filter: Option<&dyn KeyFilter>,
    min_bytes: usize,
) -> DbResult<Option<Vec<u8>>> {
    if direction == Direction::Eq {
        if let Some(f) = filter {
            if !f.contains(key) {
                return Ok(None);
            }
        }
        return super::search::fetch(tree, session, key, min_bytes);
    }

    let volume = Database::volume(tree.rl().volume())?;
    let target_depth = if key.is_left_edge() || key.is_right_edge() {
        1
    } else {
        key.depth()
    };

    super::with_retry(tree, session, |session, _writer| {
        let mut search = search_bytes(key, direction.is_forward());
        let mut allow_equal = direction.allows_equal();

        // every turn of this loop re-descends (a filter jump or a
        // predecessor hop); in-page stepping happens inside
        loop {
            let step = if direction.is_forward() {
                forward_step(
                    tree, session, &volume, &search, allow_equal, deep, target_depth, filter,
                )?
            } else {
                backward_step(
                    tree, session, &volume, &search, allow_equal, deep, target_depth, filter,
                )?
            };

            match step {
                Step::Found(found, value) => {
                    let value = resolve_value(session, &volume, value, min_bytes)?;
                    *key = found;
                    return Ok(Some(value));
                }
                Step::NoKey => return Ok(None),
                Step::Jump(bytes) => {
                    search = bytes;
                    allow_equal = true;
                }
            }
        }
    })
}

fn search_bytes(key: &Key, forward: bool) -> Vec<u8> {
    if key.is_right_edge() {
        return vec![0xFFu8; MAX_KEY_LENGTH + 1];
    }
    if key.is_left_edge() && !forward {
        return Vec::new();
    }
    key.encoded().to_vec()
}

enum Step {
    Found(Key, ValueRef),
    NoKey,
    Jump(Vec<u8>),
}

enum ValueRef {
    Inline(Vec<u8>),
    Long(LongRecordDescriptor),
}

fn resolve_value(
    session: &Session,
    volume: &Arc<Volume>,
    value: ValueRef,
    min_bytes: usize,
) -> DbResult<Vec<u8>> {
    match value {
        ValueRef::Inline(bytes) => Ok(bytes),
        ValueRef::Long(descriptor) => {
            super::long_record::read_long_record(session, volume, &descriptor, min_bytes)
        }
    }
}

fn read_value(frame: &Frame, index: usize) -> DbResult<ValueRef> {
    if frame.page.is_long_record(index) {
        Ok(ValueRef::Long(LongRecordDescriptor::decode(
            frame.page.value_at(index),
        )?))
    } else {
        Ok(ValueRef::Inline(frame.page.value_at(index).to_vec()))
    }
}

fn key_depth(encoded: &[u8]) -> usize {
    encoded
        .iter()
        .filter(|b| **b == SEGMENT_TERMINATOR)
        .count()
}

/// Examine one candidate against the deep flag and the filter.
enum Verdict {
    Accept,
    Skip,
    Stop,
    Jump(Vec<u8>),
}

fn judge(
    encoded: &[u8],
    search: &[u8],
    allow_equal: bool,
    forward: bool,
    deep: bool,
    target_depth: usize,
    filter: Option<&dyn KeyFilter>,
    direction: Direction,
) -> Verdict {
    // never step backward past (or re-report) the starting key
    if forward {
        if encoded < search || (!allow_equal && encoded == search) {
            return Verdict::Skip;
        }
    } else if encoded > search || (!allow_equal && encoded == search) {
        return Verdict::Skip;
    }

    if !deep {
        let depth = key_depth(encoded);
        if depth > target_depth {
            return Verdict::Skip;
        }
        if depth < target_depth {
            return Verdict::Stop;
        }
    }

    if let Some(f) = filter {
        let candidate = Key::from_encoded(encoded);
        if !f.contains(&candidate) {
            return match f.next(&candidate, direction) {
                Some(jump) => {
                    let beyond = if forward {
                        jump.encoded() > encoded
                    } else {
                        jump.encoded() < encoded
                    };
                    if beyond {
                        Verdict::Jump(jump.encoded().to_vec())
                    } else {
                        Verdict::Skip
                    }
                }
                None => Verdict::Stop,
            };
        }
    }

    Verdict::Accept
}

#[allow(clippy::too_many_arguments)]
fn forward_step(
    tree: &Pod<Tree>,
    session: &mut Session,
    volume: &Arc<Volume>,
    search: &[u8],
    allow_equal: bool,
    deep: bool,
    target_depth: usize,
    filter: Option<&dyn KeyFilter>,
) -> DbResult<Step> {
    let descent = search_leaf(tree, session, search, Claim::Shared)?;
    let mut frame = descent.leaf;

    let mut position = if descent.position.is_exact() && allow_equal {
        Position::exact(descent.position.index())
    } else if descent.position.is_exact() {
        frame.rl().page.traverse(descent.position, true)
    } else if descent.position.index() < frame.rl().page.key_count() {
        Position::exact(descent.position.index())
    } else {
        Position::AFTER_RIGHT_EDGE
    };

    let mut buf = Vec::new();
    loop {
        if position.is_after_right_edge() {
            // follow the right sibling; running off the last page is
            // the right edge of the keyspace
            let right = frame.rl().page.right_sibling();
            release_frame(session, &frame);
            if right == 0 {
                return Ok(Step::NoKey);
            }
            volume.check_page_address(right)?;
            let next = get_frame(session, volume, right, Claim::Shared, true)?;
            if let Err(e) = super::expect_page_type(volume, &next, PageType::Data) {
                release_frame(session, &next);
                return Err(e);
            }
            frame = next;
            position = frame.rl().page.traverse(Position::BEFORE_LEFT_EDGE, true);
            continue;
        }

        let index = position.index();
        {
            let f = frame.rl();
            f.page.key_at(index, &mut buf);
        }

        match judge(
            &buf,
            search,
            allow_equal,
            true,
            deep,
            target_depth,
            filter,
            Direction::Gteq,
        ) {
            Verdict::Accept => {
                let value = read_value(&frame.rl(), index)?;
                release_frame(session, &frame);
                return Ok(Step::Found(Key::from_encoded(&buf), value));
            }
            Verdict::Skip => {
                position = frame.rl().page.traverse(position, true);
            }
            Verdict::Stop => {
                release_frame(session, &frame);
                return Ok(Step::NoKey);
            }
            Verdict::Jump(bytes) => {
                release_frame(session, &frame);
                return Ok(Step::Jump(bytes));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn backward_step(
    tree: &Pod<Tree>,
    session: &mut Session,
    volume: &Arc<Volume>,
    search: &[u8],
    allow_equal: bool,
    deep: bool,
    target_depth: usize,
    filter: Option<&dyn KeyFilter>,
) -> DbResult<Step> {
    let descent = search_leaf(tree, session, search, Claim::Shared)?;
    let mut frame = descent.leaf;

    let mut position = if descent.position.is_exact() && allow_equal {
        Position::exact(descent.position.index())
    } else {
        // the record before the insertion point
        frame
            .rl()
            .page
            .traverse(Position::exact(descent.position.index()), false)
    };

    let mut buf = Vec::new();
    loop {
        if position.is_before_left_edge() {
            // no left sibling pointers: re-descend to the rightmost
            // leaf strictly left of this one
            let anchor = {
                let f = frame.rl();
                f.page.first_key()
            };
            release_frame(session, &frame);

            let limit = match anchor {
                Some(k) => k.encoded().to_vec(),
                // an empty leaf can only be the leftmost one
                None => return Ok(Step::NoKey),
            };
            match predecessor_leaf(tree, session, volume, &limit)? {
                Some(prev) => {
                    frame = prev;
                    let n = frame.rl().page.key_count();
                    position = frame.rl().page.traverse(Position::exact(n), false);
                    continue;
                }
                None => return Ok(Step::NoKey),
            }
        }

        let index = position.index();
        {
            let f = frame.rl();
            f.page.key_at(index, &mut buf);
        }

        match judge(
            &buf,
            search,
            allow_equal,
            false,
            deep,
            target_depth,
            filter,
            Direction::Lteq,
        ) {
            Verdict::Accept => {
                let value = read_value(&frame.rl(), index)?;
                release_frame(session, &frame);
                return Ok(Step::Found(Key::from_encoded(&buf), value));
            }
            Verdict::Skip => {
                position = frame.rl().page.traverse(position, false);
            }
            Verdict::Stop => {
                release_frame(session, &frame);
                return Ok(Step::NoKey);
            }
            Verdict::Jump(bytes) => {
                release_frame(session, &frame);
                return Ok(Step::Jump(bytes));
            }
        }
    }
}

/// Descend to the rightmost leaf whose keys all sort strictly below
/// `limit`. Returns `None` at the left edge of the keyspace.
fn predecessor_leaf(
    tree: &Pod<Tree>,
    session: &mut Session,
    volume: &Arc<Volume>,
    limit: &[u8],
) -> DbResult<Option<Pod<Frame>>> {
    let (root, depth) = {
        let t = tree.rl();
        (t.root(), t.depth())
    };
    if depth <= 1 {
        return Ok(None);
    }

    // walk down toward `limit`, remembering the deepest level where a
    // step to the left is possible
    let mut page = root;
    let mut branch: Option<(u64, u32)> = None; // (left child, its level)

    for level in (1..depth).rev() {
        let frame = get_frame(session, volume, page, Claim::Shared, true)?;
        if let Err(e) = super::expect_page_type(volume, &frame, PageType::Index) {
            release_frame(session, &frame);
            return Err(e);
        }

        let (child, left_of) = {
            let f = frame.rl();
            let pos = f.page.find_key(limit);
            let child_index = if pos.is_exact() {
                pos.index()
            } else if pos.index() == 0 {
                release_frame(session, &frame);
                return Err(volume.mark_corrupt("descent fell before the left guard"));
            } else {
                pos.index() - 1
            };
            let child = f.page.child_at(child_index)?;

            // is there a sibling slot to our left with a real child?
            let prev = f.page.traverse(Position::exact(child_index), false);
            let left_of = if prev.is_before_left_edge() {
                None
            } else {
                let i = prev.index();
                if f.page.is_guard(i) && f.page.value_at(i).is_empty() {
                    None
                } else {
                    f.page.child_at(i).ok()
                }
            };
            (child, left_of)
        };
        release_frame(session, &frame);

        if let Some(left_child) = left_of {
            branch = Some((left_child, level - 1));
        }
        page = child;
    }

    let (mut page, mut level) = match branch {
        Some(b) => b,
        None => return Ok(None),
    };

    // descend always-rightmost from the branch point
    loop {
        let frame = get_frame(session, volume, page, Claim::Shared, true)?;
        let is_leaf = level == 0;
        if is_leaf {
            if let Err(e) = super::expect_page_type(volume, &frame, PageType::Data) {
                release_frame(session, &frame);
                return Err(e);
            }
            return Ok(Some(frame));
        }
        if let Err(e) = super::expect_page_type(volume, &frame, PageType::Index) {
            release_frame(session, &frame);
            return Err(e);
        }

        let next = {
            let f = frame.rl();
            match f.page.last_record() {
                Some(i) => f.page.child_at(i)?,
                // an index page always keeps at least its guard child
                None => f.page.child_at(0)?,
            }
        };
        release_frame(session, &frame);
        if next == 0 {
            return Err(volume.mark_corrupt("predecessor descent hit a null child"));
        }
        page = next;
        level -= 1;
    }
}
