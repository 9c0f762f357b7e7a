use std::sync::Arc;

use log::{debug, trace};

use super::{
    alloc, get_frame, release_frame, search::{search_leaf, walk_right, PathLevel},
    Session, Tree,
};
use crate::{
    buffer::Frame,
    claim::Claim,
    database::Database,
    error::DbError,
    key::Key,
    page::{
        max_inline_value, max_key_length, page::TB_LONG_RECORD, PageRecord, PageType, Position,
        PutResult, SplitPolicy,
    },
    types::{Completion, PageAddress, Pod, Timestamp},
    utils::HandyRwLock,
    volume::Volume,
};

const SEPARATOR_OVERHEAD: usize = 8 + 6 + 8;

/// Store a key/value pair, spilling oversized values into a
/// long-record chain whose pages are journaled before the leaf is
/// touched.
pub fn store(tree: &Pod<Tree>, session: &mut Session, key: &Key, value: &[u8]) -> Completion {
    let volume = Database::volume(tree.rl().volume())?;
    validate_key(&volume, key)?;
    if volume.is_read_only() {
        return Err(DbError::validation(&format!(
            "volume {} is read-only",
            volume.name()
        )));
    }

    if value.len() > max_inline_value(volume.page_size()) {
        let ts = Database::allocate_timestamp();
        let descriptor = super::long_record::write_long_record(session, &volume, value, ts)?;
        let encoded = descriptor.encode();
        if let Err(e) = store_raw(tree, session, key, &encoded, TB_LONG_RECORD) {
            // the chain was allocated ahead of the leaf insert; give it
            // back on failure
            let _ = super::long_record::free_chain(session, &volume, &descriptor);
            return Err(e);
        }
        return Ok(());
    }

    store_raw(tree, session, key, value, 0)
}

/// Store with the value bytes taken literally (inline bytes or an
/// already-built long-record descriptor). The commit apply path and
/// the recovery listener come through here.
pub fn store_raw(
    tree: &Pod<Tree>,
    session: &mut Session,
    key: &Key,
    value: &[u8],
    tb_flags: u8,
) -> Completion {
    let volume = Database::volume(tree.rl().volume())?;
    validate_key(&volume, key)?;
    if volume.is_read_only() {
        return Err(DbError::validation(&format!(
            "volume {} is read-only",
            volume.name()
        )));
    }

    let handle = tree.rl().handle();
    let policy = session.observe_insert(handle, key.encoded());

    super::with_retry(tree, session, |session, tree_writer| {
        store_attempt(tree, session, &volume, key, value, tb_flags, policy, tree_writer)
    })?;

    tree.rl().bump_change_count();
    Ok(())
}

fn validate_key(volume: &Arc<Volume>, key: &Key) -> Completion {
    if key.is_empty() || key.is_right_edge() {
        return Err(DbError::validation("store requires a real key"));
    }
    if key.len() > max_key_length(volume.page_size()) {
        return Err(DbError::validation(&format!(
            "key of {} bytes exceeds the page-size bound {}",
            key.len(),
            max_key_length(volume.page_size())
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn store_attempt(
    tree: &Pod<Tree>,
    session: &mut Session,
    volume: &Arc<Volume>,
    key: &Key,
    value: &[u8],
    tb_flags: u8,
    policy: SplitPolicy,
    tree_writer: bool,
) -> Completion {
    let descent = search_leaf(tree, session, key.encoded(), Claim::Exclusive)?;
    let ts = Database::allocate_timestamp();

    // a replaced long record surrenders its old chain once the new
    // value is in place
    let old_chain = if descent.position.is_exact() {
        let f = descent.leaf.rl();
        let index = descent.position.index();
        if f.page.is_long_record(index) {
            Some(crate::value::LongRecordDescriptor::decode(
                f.page.value_at(index),
            )?)
        } else {
            None
        }
    } else {
        None
    };

    Database::write_page_on_checkpoint(&descent.leaf, ts)?;
    let put = {
        let mut frame = descent.leaf.wl();
        let result = frame
            .page
            .put_value(key.encoded(), value, tb_flags, descent.position, true)?;
        if result == PutResult::Stored {
            frame.mark_dirty(ts);
            frame.bump_generation();
        }
        result
    };

    let result = match put {
        PutResult::Stored => {
            {
                let t = tree.rl();
                let f = descent.leaf.rl();
                let position = Position::exact(descent.position.index());
                session.cache_leaf(&t, key.encoded(), descent.leaf_page, f.generation(), position);
            }
            release_frame(session, &descent.leaf);
            Ok(())
        }
        PutResult::PageFull => {
            if !tree_writer {
                release_frame(session, &descent.leaf);
                return Err(DbError::retry("leaf split needs the tree-writer claim"));
            }
            let result = split_and_store(
                tree, session, volume, key, value, tb_flags, policy, ts, &descent.leaf,
                &descent.path,
            );
            release_frame(session, &descent.leaf);
            result
        }
    };

    if result.is_ok() {
        if let Some(descriptor) = old_chain {
            super::long_record::free_chain(session, volume, &descriptor)?;
        }
    }
    result
}

/// Split the full leaf, place the pending record on the proper side,
/// then promote the separator up the tree (splitting index pages as
/// needed, growing a new root when the promotion passes the top).
/// Runs under the tree-writer claim.
#[allow(clippy::too_many_arguments)]
fn split_and_store(
    tree: &Pod<Tree>,
    session: &mut Session,
    volume: &Arc<Volume>,
    key: &Key,
    value: &[u8],
    tb_flags: u8,
    policy: SplitPolicy,
    ts: Timestamp,
    left: &Pod<Frame>,
    path: &[PathLevel],
) -> Completion {
    let insert_size = SEPARATOR_OVERHEAD - 8 + key.len() + value.len();
    let right_addr = alloc::allocate_page(session, volume)?;
    let right = get_frame(session, volume, right_addr, Claim::Exclusive, false)?;

    let page_type = left.rl().page.page_type()?;
    let split_key = {
        let mut lf = left.wl();
        let mut rf = right.wl();
        rf.page.init_as(page_type, right_addr);

        let found_key = lf.page.find_key(key.encoded());
        let split_key = lf.page.split(
            &mut rf.page,
            key.encoded(),
            insert_size,
            found_key,
            policy,
        )?;

        lf.mark_dirty(ts);
        lf.bump_generation();
        rf.mark_dirty(ts);
        rf.bump_generation();
        split_key
    };
    tree.rl().bump_generation();

    debug!(
        "split page {} -> {} at key {:?}",
        left.rl().page.page_address(),
        right_addr,
        split_key
    );

    // the pending record goes to whichever side now owns its key
    let target = if key.encoded() >= split_key.encoded() {
        &right
    } else {
        left
    };
    {
        let mut frame = target.wl();
        let position = frame.page.find_key(key.encoded());
        if frame
            .page
            .put_value(key.encoded(), value, tb_flags, position, true)?
            != PutResult::Stored
        {
            return Err(volume.mark_corrupt("record does not fit its side after a split"));
        }
        frame.mark_dirty(ts);
        frame.bump_generation();
    }

    let left_addr = left.rl().page.page_address();
    release_frame(session, &right);

    promote(
        tree, session, volume, path, 1, split_key, right_addr, left_addr, ts,
    )
}

/// Insert the separator for a fresh right sibling into the parent
/// level, recursing upward while parents split. Also serves the remove
/// path's deferred reindex (an ordinary separator insert performed
/// after the coalesce pass).
#[allow(clippy::too_many_arguments)]
pub(crate) fn promote(
    tree: &Pod<Tree>,
    session: &mut Session,
    volume: &Arc<Volume>,
    path: &[PathLevel],
    start_level: u32,
    split_key: Key,
    child: PageAddress,
    split_left: PageAddress,
    ts: Timestamp,
) -> Completion {
    let mut separator = split_key;
    let mut child_addr = child;
    let mut left_of_top = split_left;
    let mut level: u32 = start_level;

    loop {
        let parent = path.iter().find(|p| p.level == level).map(|p| p.page);

        let parent_page = match parent {
            Some(page) => page,
            None => {
                // the promotion passed the top: a new root one level up
                return grow_root(tree, session, volume, &separator, child_addr, left_of_top, ts);
            }
        };

        let frame = get_frame(session, volume, parent_page, Claim::Exclusive, true)?;
        if let Err(e) = super::expect_page_type(volume, &frame, PageType::Index) {
            release_frame(session, &frame);
            return Err(e);
        }
        let (frame, frame_page, position) = walk_right(
            session,
            volume,
            frame,
            parent_page,
            separator.encoded(),
            Claim::Exclusive,
            false,
        )?;

        Database::write_page_on_checkpoint(&frame, ts)?;
        let put = {
            let mut f = frame.wl();
            let result = f.page.put_value(
                separator.encoded(),
                &child_addr.to_be_bytes(),
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

        if put == PutResult::Stored {
            release_frame(session, &frame);
            return Ok(());
        }

        // parent is full too: split it and keep promoting
        let new_index_addr = alloc::allocate_page(session, volume)?;
        let new_index = get_frame(session, volume, new_index_addr, Claim::Exclusive, false)?;

        let parent_split_key = {
            let mut lf = frame.wl();
            let mut rf = new_index.wl();
            rf.page.init_as(PageType::Index, new_index_addr);

            let position = lf.page.find_key(separator.encoded());
            let sep_size = SEPARATOR_OVERHEAD + separator.len();
            let split = lf
                .page
                .split(&mut rf.page, separator.encoded(), sep_size, position, SplitPolicy::Even)?;

            lf.mark_dirty(ts);
            lf.bump_generation();
            rf.mark_dirty(ts);
            rf.bump_generation();
            split
        };
        tree.rl().bump_generation();

        let target = if separator.encoded() >= parent_split_key.encoded() {
            &new_index
        } else {
            &frame
        };
        {
            let mut f = target.wl();
            let position = f.page.find_key(separator.encoded());
            if f.page.put_value(
                separator.encoded(),
                &child_addr.to_be_bytes(),
                0,
                position,
                true,
            )? != PutResult::Stored
            {
                return Err(volume.mark_corrupt("separator does not fit after an index split"));
            }
            f.mark_dirty(ts);
            f.bump_generation();
        }

        trace!(
            "index page {} split into {} while promoting",
            frame_page,
            new_index_addr
        );

        release_frame(session, &new_index);
        release_frame(session, &frame);

        separator = parent_split_key;
        child_addr = new_index_addr;
        left_of_top = frame_page;
        level += 1;
    }
}

/// Allocate a new root one level above the old one. The left guard of
/// the new root carries the old top page; the single record points at
/// the freshly split-off right page.
#[allow(clippy::too_many_arguments)]
fn grow_root(
    tree: &Pod<Tree>,
    session: &mut Session,
    volume: &Arc<Volume>,
    separator: &Key,
    child: PageAddress,
    left_of_top: PageAddress,
    ts: Timestamp,
) -> Completion {
    let old_root = tree.rl().root();
    if left_of_top != old_root {
        return Err(volume.mark_corrupt(&format!(
            "promotion passed the top at page {} but the root is {}",
            left_of_top, old_root
        )));
    }

    let new_root_addr = alloc::allocate_page(session, volume)?;
    let frame = get_frame(session, volume, new_root_addr, Claim::Exclusive, false)?;
    {
        let mut f = frame.wl();
        f.page.init_as(PageType::Index, new_root_addr);
        let record = PageRecord {
            key: separator.encoded().to_vec(),
            value: child.to_be_bytes().to_vec(),
            flags: 0,
        };
        if f.page.encode_records(&[record], &old_root.to_be_bytes())?
            != PutResult::Stored
        {
            return Err(volume.mark_corrupt("new root does not hold a single separator"));
        }
        f.mark_dirty(ts);
        f.bump_generation();
        f.set_fixed(true);
    }
    release_frame(session, &frame);

    {
        let t = tree.rl();
        t.set_root(new_root_addr);
        t.set_depth(t.depth() + 1);
        t.bump_generation();
    }
    Database::buffer_pool().set_fixed(
        crate::types::PageKey::new(volume.handle(), old_root),
        false,
    );

    debug!(
        "tree {} grew a new root {} (depth {})",
        tree.rl().handle(),
        new_root_addr,
        tree.rl().depth()
    );

    Database::save_tree_metadata(tree, session)
}
