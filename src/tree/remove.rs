use std::sync::Arc;

use log::debug;

use super::{
    alloc, get_frame, release_frame,
    search::{search_leaf, PathLevel},
    store, Session, Tree,
};
use crate::{
    buffer::Frame,
    claim::Claim,
    database::Database,
    error::DbError,
    key::{Key, MAX_KEY_LENGTH},
    page::{PageType, PutResult, SplitPolicy},
    types::{Completion, DbResult, PageAddress, Pod, Timestamp},
    utils::HandyRwLock,
    value::LongRecordDescriptor,
    volume::Volume,
};

/// Remove a single key. Expressed as the removal of the half-open
/// range `[key, key+0x00)`, which covers exactly that key and no
/// logical child.
pub fn remove(tree: &Pod<Tree>, session: &mut Session, key: &Key) -> DbResult<bool> {
    if key.is_empty() || key.is_right_edge() {
        return Err(DbError::validation("remove requires a real key"));
    }
    let mut high = Key::from_encoded(key.encoded());
    // one zero byte past the key sorts immediately after it
    let mut bytes = high.encoded().to_vec();
    bytes.push(0);
    high = Key::from_encoded(&bytes);
    remove_key_range(tree, session, key, &high)
}

/// Remove every key in the half-open range `[low, high)`.
///
/// Fast path: both endpoints land in one leaf; a writer claim on that
/// leaf suffices. Slow path: the endpoints span pages; the operation
/// upgrades to the tree-writer claim, descends once per endpoint, and
/// walks back up coalescing or rebalancing the boundary pair at each
/// level while the freed span goes to the garbage chain.
pub fn remove_key_range(
    tree: &Pod<Tree>,
    session: &mut Session,
    low: &Key,
    high: &Key,
) -> DbResult<bool> {
    if low >= high {
        return Err(DbError::validation("remove range is empty or inverted"));
    }
    let volume = Database::volume(tree.rl().volume())?;
    if volume.is_read_only() {
        return Err(DbError::validation(&format!(
            "volume {} is read-only",
            volume.name()
        )));
    }

    let removed = super::with_retry(tree, session, |session, tree_writer| {
        remove_attempt(tree, session, &volume, low, high, tree_writer)
    })?;

    if removed {
        tree.rl().bump_change_count();
    }
    Ok(removed)
}

/// Search bytes for a bound: the right edge maps to a pseudo-key
/// longer and greater than any storable encoding.
fn bound_bytes(key: &Key) -> Vec<u8> {
    if key.is_right_edge() {
        vec![0xFFu8; MAX_KEY_LENGTH + 1]
    } else {
        key.encoded().to_vec()
    }
}

struct Harvest {
    descriptors: Vec<LongRecordDescriptor>,
}

impl Harvest {
    fn new() -> Harvest {
        Harvest {
            descriptors: Vec::new(),
        }
    }

    /// Collect long-record descriptors from the keyblock range
    /// `[from, to)` so their chains can be freed once the removal
    /// sticks.
    fn collect(&mut self, frame: &Frame, from: usize, to: usize) -> Completion {
        for i in from..to {
            if frame.page.is_guard(i) {
                continue;
            }
            if frame.page.is_long_record(i) {
                self.descriptors
                    .push(LongRecordDescriptor::decode(frame.page.value_at(i))?);
            }
        }
        Ok(())
    }
}

fn remove_attempt(
    tree: &Pod<Tree>,
    session: &mut Session,
    volume: &Arc<Volume>,
    low: &Key,
    high: &Key,
    tree_writer: bool,
) -> DbResult<bool> {
    let low_bytes = bound_bytes(low);
    let high_bytes = bound_bytes(high);

    let descent = search_leaf(tree, session, &low_bytes, Claim::Exclusive)?;
    let p1 = descent.position.index();

    // both endpoints inside this one leaf?
    let (same_leaf, p2) = {
        let f = descent.leaf.rl();
        let pos = f.page.find_key(&high_bytes);
        let spans = !pos.is_exact()
            && pos.index() >= f.page.key_count()
            && f.page.right_sibling() != 0;
        (!spans, pos.index())
    };

    if same_leaf {
        if p2 <= p1 {
            release_frame(session, &descent.leaf);
            return Ok(false);
        }
        let ts = Database::allocate_timestamp();
        let mut harvest = Harvest::new();
        harvest.collect(&descent.leaf.rl(), p1, p2)?;

        Database::write_page_on_checkpoint(&descent.leaf, ts)?;
        {
            let mut f = descent.leaf.wl();
            f.page.remove_keys(p1, p2)?;
            f.mark_dirty(ts);
            f.bump_generation();
        }
        release_frame(session, &descent.leaf);
        session.drop_cache(tree.rl().handle());

        free_harvest(session, volume, harvest)?;
        return Ok(true);
    }

    release_frame(session, &descent.leaf);
    if !tree_writer {
        return Err(DbError::retry("range remove spans pages"));
    }

    remove_span(tree, session, volume, &low_bytes, &high_bytes)
}

/// The slow path, under the tree-writer claim.
fn remove_span(
    tree: &Pod<Tree>,
    session: &mut Session,
    volume: &Arc<Volume>,
    low_bytes: &[u8],
    high_bytes: &[u8],
) -> DbResult<bool> {
    let ts = Database::allocate_timestamp();
    let mut harvest = Harvest::new();
    let mut freed: Vec<PageAddress> = Vec::new();
    let mut deferred: Vec<(u32, Key, PageAddress)> = Vec::new();

    // one descent per endpoint, recording {left, right, found-at} per
    // level
    let left_descent = search_leaf(tree, session, low_bytes, Claim::Exclusive)?;
    let right_descent = search_leaf(tree, session, high_bytes, Claim::Exclusive)?;

    let left_addr = left_descent.leaf_page;
    let right_addr = right_descent.leaf_page;
    if left_addr == right_addr {
        // a concurrent-free world cannot reach this under the writer
        // claim unless the fast-path check raced a prior retry; redo as
        // a fast remove
        let p1 = left_descent.position.index();
        let p2 = right_descent.position.index();
        release_frame(session, &right_descent.leaf);
        if p2 <= p1 {
            release_frame(session, &left_descent.leaf);
            return Ok(false);
        }
        harvest.collect(&left_descent.leaf.rl(), p1, p2)?;
        Database::write_page_on_checkpoint(&left_descent.leaf, ts)?;
        {
            let mut f = left_descent.leaf.wl();
            f.page.remove_keys(p1, p2)?;
            f.mark_dirty(ts);
            f.bump_generation();
        }
        release_frame(session, &left_descent.leaf);
        free_harvest(session, volume, harvest)?;
        return Ok(true);
    }

    let p1 = left_descent.position.index();
    let p2 = right_descent.position.index();

    // harvest and free the leaves strictly between the two endpoints
    let middle = collect_middle_pages(
        session,
        volume,
        &mut harvest,
        left_descent.leaf.rl().page.right_sibling(),
        right_addr,
    )?;
    freed.extend(middle);

    {
        let lf = left_descent.leaf.rl();
        harvest.collect(&lf, p1, lf.page.key_count())?;
    }
    harvest.collect(&right_descent.leaf.rl(), 0, p2)?;

    // trim both boundary leaves, splice out the middle span, then
    // coalesce or rebalance the pair
    Database::write_page_on_checkpoint(&left_descent.leaf, ts)?;
    Database::write_page_on_checkpoint(&right_descent.leaf, ts)?;
    let mut outcome = {
        let mut lf = left_descent.leaf.wl();
        let mut rf = right_descent.leaf.wl();
        let n = lf.page.key_count();
        lf.page.remove_keys(p1, n)?;
        rf.page.remove_keys(0, p2)?;
        lf.page.set_right_sibling(right_addr);

        let joined = lf.page.join(&mut rf.page, SplitPolicy::Even)?;
        lf.mark_dirty(ts);
        lf.bump_generation();
        rf.mark_dirty(ts);
        rf.bump_generation();
        joined
    };
    if outcome.is_none() {
        freed.push(right_addr);
    }

    // the (left, right) pairs stay claimed from leaf to root and are
    // released in one pass on the way out
    let mut held = vec![left_descent.leaf.clone(), right_descent.leaf.clone()];

    let mut right_child = right_addr;

    // walk back up, one level per pass
    let depth = tree.rl().depth();
    for level in 1..depth {
        let lp = path_entry(&left_descent.path, level)?;
        let rp = path_entry(&right_descent.path, level)?;

        if lp.page == rp.page {
            fix_converged_level(
                session, volume, &lp, &rp, outcome.take(), right_child, ts, &mut deferred,
                &mut held,
            )?;
            outcome = None;
            break;
        }

        let (next_outcome, freed_here) = fix_boundary_level(
            session,
            volume,
            &lp,
            &rp,
            outcome.take(),
            right_child,
            ts,
            &mut harvest,
            &mut deferred,
            &mut held,
        )?;
        freed.extend(freed_here);
        outcome = next_outcome;
        right_child = rp.page;
    }

    if let Some(new_sep) = outcome {
        // the pair was rebalanced at the root level itself; reindexing
        // has nowhere higher to go, which means the root split
        // separator is stale
        return Err(volume.mark_corrupt(&format!(
            "unanchored separator {:?} above the root",
            new_sep
        )));
    }

    // deferred reindexes run as ordinary separator inserts now that
    // the coalesce pass has released its pairs
    for (level, sep, child) in deferred {
        insert_separator_at_level(tree, session, volume, level, sep, child, ts)?;
    }

    shrink_root(tree, session, volume)?;

    alloc::deallocate_pages(session, volume, &freed)?;
    free_harvest(session, volume, harvest)?;

    for frame in held.iter() {
        release_frame(session, frame);
    }
    {
        let t = tree.rl();
        t.bump_generation();
    }
    session.drop_cache(tree.rl().handle());
    Database::save_tree_metadata(tree, session)?;

    debug!(
        "range remove spanned pages; {} pages returned to the garbage chain",
        freed.len()
    );
    Ok(true)
}

fn path_entry(path: &[PathLevel], level: u32) -> DbResult<PathLevel> {
    path.iter()
        .find(|p| p.level == level)
        .copied()
        .ok_or_else(|| DbError::corruption(&format!("descent path misses level {}", level)))
}

/// Walk the sibling chain from `start` to `stop`, harvesting every
/// record and collecting the page addresses for deallocation.
fn collect_middle_pages(
    session: &Session,
    volume: &Arc<Volume>,
    harvest: &mut Harvest,
    start: PageAddress,
    stop: PageAddress,
) -> DbResult<Vec<PageAddress>> {
    let mut pages = Vec::new();
    let mut page = start;
    let bound = volume.extended_page_count();

    while page != stop {
        if page == 0 || pages.len() as u64 > bound {
            return Err(volume.mark_corrupt(
                "sibling chain between removal endpoints does not reach the right page",
            ));
        }
        volume.check_page_address(page)?;
        let frame = get_frame(session, volume, page, Claim::Exclusive, true)?;
        let next = {
            let f = frame.rl();
            harvest.collect(&f, 0, f.page.key_count())?;
            f.page.right_sibling()
        };
        release_frame(session, &frame);
        pages.push(page);
        page = next;
    }
    Ok(pages)
}

/// Both descents pass through the same index page: drop the slots
/// covering the freed span and reindex the surviving right child when
/// the pair below was rebalanced.
#[allow(clippy::too_many_arguments)]
fn fix_converged_level(
    session: &mut Session,
    volume: &Arc<Volume>,
    lp: &PathLevel,
    rp: &PathLevel,
    rebalanced: Option<Key>,
    right_child: PageAddress,
    ts: Timestamp,
    deferred: &mut Vec<(u32, Key, PageAddress)>,
    held: &mut Vec<crate::types::Pod<crate::buffer::Frame>>,
) -> Completion {
    let frame = get_frame(session, volume, lp.page, Claim::Exclusive, true)?;
    super::expect_page_type(volume, &frame, PageType::Index)?;

    Database::write_page_on_checkpoint(&frame, ts)?;
    {
        let mut f = frame.wl();
        f.page.remove_keys(lp.child_index + 1, rp.child_index + 1)?;
        f.mark_dirty(ts);
        f.bump_generation();
    }

    if let Some(sep) = rebalanced {
        let stored = {
            let mut f = frame.wl();
            let position = f.page.find_key(sep.encoded());
            let result =
                f.page
                    .put_value(sep.encoded(), &right_child.to_be_bytes(), 0, position, true)?;
            if result == PutResult::Stored {
                f.mark_dirty(ts);
                f.bump_generation();
            }
            result
        };
        if stored == PutResult::PageFull {
            deferred.push((lp.level, sep, right_child));
        }
    }

    held.push(frame);
    Ok(())
}

/// The descents pass through different index pages at this level: trim
/// both, splice out the middle pages, join the pair, and thread the
/// pending reindex from the level below into whichever side now covers
/// it.
#[allow(clippy::too_many_arguments)]
fn fix_boundary_level(
    session: &mut Session,
    volume: &Arc<Volume>,
    lp: &PathLevel,
    rp: &PathLevel,
    rebalanced_below: Option<Key>,
    right_child_below: PageAddress,
    ts: Timestamp,
    harvest: &mut Harvest,
    deferred: &mut Vec<(u32, Key, PageAddress)>,
    held: &mut Vec<crate::types::Pod<crate::buffer::Frame>>,
) -> DbResult<(Option<Key>, Vec<PageAddress>)> {
    let mut freed = Vec::new();

    let left = get_frame(session, volume, lp.page, Claim::Exclusive, true)?;
    super::expect_page_type(volume, &left, PageType::Index)?;
    let right = get_frame(session, volume, rp.page, Claim::Exclusive, true)?;
    super::expect_page_type(volume, &right, PageType::Index)?;

    let middle = collect_middle_pages(
        session,
        volume,
        harvest,
        left.rl().page.right_sibling(),
        rp.page,
    )?;
    freed.extend(middle);

    Database::write_page_on_checkpoint(&left, ts)?;
    Database::write_page_on_checkpoint(&right, ts)?;

    let outcome = {
        let mut lf = left.wl();
        let mut rf = right.wl();

        // left page: every slot right of the descent slot is dead
        let n = lf.page.key_count();
        let guard = if n > 0 && lf.page.is_guard(n - 1) { n - 1 } else { n };
        lf.page.remove_keys(lp.child_index + 1, guard)?;

        // right page: slots left of the descent slot are dead; the
        // descent slot itself goes too (its child merged or its key
        // changed)
        rf.page.remove_keys(1, rp.child_index + 1)?;

        lf.page.set_right_sibling(rp.page);
        let joined = lf.page.join(&mut rf.page, SplitPolicy::Even)?;

        lf.mark_dirty(ts);
        lf.bump_generation();
        rf.mark_dirty(ts);
        rf.bump_generation();
        joined
    };

    // reinstate the separator for the surviving right child of the
    // level below
    if let Some(sep) = rebalanced_below {
        let target = match &outcome {
            Some(level_sep) if sep.encoded() >= level_sep.encoded() => &right,
            _ => &left,
        };
        let stored = {
            let mut f = target.wl();
            let position = f.page.find_key(sep.encoded());
            let result = f.page.put_value(
                sep.encoded(),
                &right_child_below.to_be_bytes(),
                0,
                position,
                true,
            )?;
            if result == PutResult::Stored {
                f.mark_dirty(ts);
                f.bump_generation();
            }
            result
        };
        if stored == PutResult::PageFull {
            deferred.push((lp.level, sep, right_child_below));
        }
    }

    if outcome.is_none() {
        freed.push(rp.page);
    }

    held.push(right);
    held.push(left);
    Ok((outcome, freed))
}

/// While the root is an index page with no separators left, its lone
/// guard child becomes the new root.
fn shrink_root(tree: &Pod<Tree>, session: &mut Session, volume: &Arc<Volume>) -> Completion {
    loop {
        let (root, depth) = {
            let t = tree.rl();
            (t.root(), t.depth())
        };
        if depth <= 1 {
            return Ok(());
        }

        let frame = get_frame(session, volume, root, Claim::Exclusive, true)?;
        let next_root = {
            let f = frame.rl();
            if f.page.page_type()? != PageType::Index || f.page.record_count() > 0 {
                None
            } else {
                Some(f.page.child_at(0)?)
            }
        };
        release_frame(session, &frame);

        let new_root = match next_root {
            Some(p) => p,
            None => return Ok(()),
        };
        if new_root == 0 {
            return Err(volume.mark_corrupt("empty root has no leftmost child"));
        }

        {
            let t = tree.rl();
            t.set_root(new_root);
            t.set_depth(depth - 1);
            t.bump_generation();
        }
        Database::buffer_pool()
            .set_fixed(crate::types::PageKey::new(volume.handle(), new_root), true);
        Database::buffer_pool()
            .set_fixed(crate::types::PageKey::new(volume.handle(), root), false);
        alloc::deallocate_page(session, volume, root)?;
        debug!("root shrank to page {} (depth {})", new_root, depth - 1);
    }
}

/// Deferred reindex: insert a separator at an interior level through
/// the ordinary promotion machinery (which may split the target page
/// and continue upward).
fn insert_separator_at_level(
    tree: &Pod<Tree>,
    session: &mut Session,
    volume: &Arc<Volume>,
    level: u32,
    sep: Key,
    child: PageAddress,
    ts: Timestamp,
) -> Completion {
    // rebuild a path covering the levels at and above the target
    let mut page = tree.rl().root();
    let mut current = tree.rl().depth() - 1;
    let mut path: Vec<PathLevel> = Vec::new();

    while current >= level {
        let frame = get_frame(session, volume, page, Claim::Shared, true)?;
        super::expect_page_type(volume, &frame, PageType::Index)?;
        let position = frame.rl().page.find_key(sep.encoded());
        let child_index = if position.is_exact() {
            position.index()
        } else if position.index() == 0 {
            release_frame(session, &frame);
            return Err(volume.mark_corrupt("separator descent fell before the left guard"));
        } else {
            position.index() - 1
        };
        let next = frame.rl().page.child_at(child_index)?;
        release_frame(session, &frame);

        path.push(PathLevel {
            page,
            child_index,
            level: current,
        });
        if current == level {
            break;
        }
        page = next;
        current -= 1;
    }

    store::promote(tree, session, volume, &path, level, sep, child, 0, ts)
}

fn free_harvest(session: &Session, volume: &Arc<Volume>, harvest: Harvest) -> Completion {
    for descriptor in harvest.descriptors {
        super::long_record::free_chain(session, volume, &descriptor)?;
    }
    Ok(())
}
