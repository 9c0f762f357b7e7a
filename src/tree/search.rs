use std::sync::Arc;

use log::trace;

use super::{expect_page_type, get_frame, release_frame, Session, Tree, MAX_WALK_RIGHT};
use crate::{
    buffer::Frame,
    claim::Claim,
    database::Database,
    error::DbError,
    key::Key,
    page::{PageType, Position},
    types::{DbResult, PageAddress, Pod},
    utils::HandyRwLock,
    volume::Volume,
};

/// Outcome of a descent: the claimed, pinned leaf frame plus the path
/// of index pages walked to reach it (root first). Upper levels are
/// not claimed; the B-link protocol tolerates their drift.
pub(crate) struct Descent {
    pub leaf: Pod<Frame>,
    pub leaf_page: PageAddress,
    pub position: Position,
    pub path: Vec<PathLevel>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PathLevel {
    pub page: PageAddress,
    /// Index of the child slot the descent followed.
    pub child_index: usize,
    pub level: u32,
}

/// Decide whether the search key may overshoot this page: it landed
/// past the last record and a right sibling exists.
fn past_right_edge(frame: &Frame, position: Position, is_leaf: bool) -> bool {
    if position.is_exact() {
        return false;
    }
    let n = frame.page.key_count();
    if is_leaf {
        position.index() >= n
    } else {
        // on index pages the search never passes the right guard;
        // landing just before it means the key exceeds every separator
        n >= 1 && position.index() == n - 1 && frame.page.is_guard(n - 1)
    }
}

/// Follow right siblings while the key provably belongs further right
/// (the sibling's first key does not exceed it). Bounded; an overrun
/// marks the volume corrupt.
pub(crate) fn walk_right(
    session: &Session,
    volume: &Arc<Volume>,
    mut frame: Pod<Frame>,
    mut page: PageAddress,
    key: &[u8],
    claim: Claim,
    is_leaf: bool,
) -> DbResult<(Pod<Frame>, PageAddress, Position)> {
    let mut walks = 0;
    loop {
        let position = frame.rl().page.find_key(key);
        let right = frame.rl().page.right_sibling();
        if !past_right_edge(&frame.rl(), position, is_leaf) || right == 0 {
            return Ok((frame, page, position));
        }

        volume.check_page_address(right)?;
        let sibling = get_frame(session, volume, right, claim, true)?;
        let go_right = match sibling.rl().page.first_key() {
            Some(first) => first.encoded() <= key,
            // an empty sibling cannot be ruled out; keep walking
            None => sibling.rl().page.right_sibling() != 0,
        };

        if !go_right {
            release_frame(session, &sibling);
            return Ok((frame, page, position));
        }

        release_frame(session, &frame);
        frame = sibling;
        page = right;
        walks += 1;
        trace!("walk right to page {} ({} steps)", page, walks);
        if walks > MAX_WALK_RIGHT {
            release_frame(session, &frame);
            return Err(volume.mark_corrupt(&format!(
                "right-walk exceeded {} steps near page {}",
                MAX_WALK_RIGHT, page
            )));
        }
    }
}

/// Top-down search to the leaf containing (the insertion point of)
/// `key`. One frame claim per level; the parent's claim is released
/// once the child is claimed.
pub(crate) fn search_leaf(
    tree: &Pod<Tree>,
    session: &mut Session,
    key: &[u8],
    leaf_claim: Claim,
) -> DbResult<Descent> {
    let (volume_handle, root, depth) = {
        let t = tree.rl();
        (t.volume(), t.root(), t.depth())
    };
    let volume = Database::volume(volume_handle)?;

    // level cache: identical key and unchanged generations let the
    // descent be skipped outright
    if let Some((leaf, generation, position)) = {
        let t = tree.rl();
        session.cached_leaf(&t, key)
    } {
        let frame = get_frame(session, &volume, leaf, leaf_claim, true)?;
        let fresh = {
            let f = frame.rl();
            f.is_valid() && f.generation() == generation
        };
        if fresh {
            trace!("level cache hit on page {}", leaf);
            return Ok(Descent {
                leaf: frame,
                leaf_page: leaf,
                position,
                path: Vec::new(),
            });
        }
        release_frame(session, &frame);
    }

    if depth == 0 || root == 0 {
        return Err(volume.mark_corrupt("tree has no root"));
    }

    let mut page = root;
    let mut level = depth - 1;
    let mut path = Vec::with_capacity(depth as usize);

    loop {
        let is_leaf = level == 0;
        let claim = if is_leaf { leaf_claim } else { Claim::Shared };
        let frame = get_frame(session, &volume, page, claim, true)?;

        let expected = if is_leaf { PageType::Data } else { PageType::Index };
        if let Err(e) = expect_page_type(&volume, &frame, expected) {
            release_frame(session, &frame);
            return Err(e);
        }

        let (frame, page_now, position) =
            walk_right(session, &volume, frame, page, key, claim, is_leaf)?;
        page = page_now;

        if is_leaf {
            {
                let t = tree.rl();
                let f = frame.rl();
                session.cache_leaf(&t, key, page, f.generation(), position);
            }
            return Ok(Descent {
                leaf: frame,
                leaf_page: page,
                position,
                path,
            });
        }

        let child_index = if position.is_exact() {
            position.index()
        } else {
            if position.index() == 0 {
                release_frame(session, &frame);
                return Err(volume.mark_corrupt(&format!(
                    "search fell before the left guard on index page {}",
                    page
                )));
            }
            position.index() - 1
        };
        let child = {
            let f = frame.rl();
            f.page.child_at(child_index)
        };
        let child = match child {
            Ok(c) => c,
            Err(e) => {
                release_frame(session, &frame);
                return Err(volume.mark_corrupt(e.details()));
            }
        };

        path.push(PathLevel {
            page,
            child_index,
            level,
        });
        release_frame(session, &frame);

        if child == 0 {
            return Err(volume.mark_corrupt(&format!(
                "index page {} slot {} holds a null child",
                page, child_index
            )));
        }
        volume.check_page_address(child)?;
        page = child;
        level -= 1;
    }
}

/// Point lookup. Returns the value bytes, resolving a long-record
/// descriptor through its chain; `min_bytes` permits partial reads of
/// long values.
pub fn fetch(
    tree: &Pod<Tree>,
    session: &mut Session,
    key: &Key,
    min_bytes: usize,
) -> DbResult<Option<Vec<u8>>> {
    if key.is_empty() || key.is_right_edge() {
        return Err(DbError::validation("fetch requires a real key"));
    }

    super::with_retry(tree, session, |session, _writer| {
        let volume = Database::volume(tree.rl().volume())?;
        let descent = search_leaf(tree, session, key.encoded(), Claim::Shared)?;

        let result = if descent.position.is_exact() {
            let index = descent.position.index();
            let f = descent.leaf.rl();
            if f.page.is_long_record(index) {
                let descriptor =
                    crate::value::LongRecordDescriptor::decode(f.page.value_at(index))?;
                drop(f);
                let bytes = super::long_record::read_long_record(
                    session,
                    &volume,
                    &descriptor,
                    min_bytes,
                )?;
                Some(bytes)
            } else {
                Some(f.page.value_at(index).to_vec())
            }
        } else {
            None
        };

        release_frame(session, &descent.leaf);
        Ok(result)
    })
}

#[cfg(test)]
mod tests {
    use crate::page::{Page, PageType};

    #[test]
    fn overshoot_lands_past_the_last_record() {
        let mut leaf = Page::new(1024);
        leaf.init_as(PageType::Data, 3);
        let mut key = crate::key::Key::new();
        key.append(&[5]).unwrap();
        let pos = leaf.find_key(key.encoded());
        leaf.put_value(key.encoded(), b"v", 0, pos, true).unwrap();

        let past = leaf.find_key(&[9, 0]);
        assert!(!past.is_exact());
        assert_eq!(past.index(), leaf.key_count());

        let inside = leaf.find_key(&[1, 0]);
        assert_eq!(inside.index(), 0);

        assert!(leaf.find_key(key.encoded()).is_exact());
    }
}
