pub mod alloc;
pub mod cursor;
pub mod icheck;
pub mod long_record;
pub mod remove;
pub mod search;
pub mod store;
pub mod traverse;

use core::fmt;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use log::debug;

use crate::{
    buffer::Frame,
    claim::{Claim, ClaimTarget},
    database::Database,
    error::DbError,
    page::{PageType, SplitPolicy},
    types::{Completion, DbResult, PageAddress, Pod, SessionId, TreeHandle, VolumeHandle},
    utils::HandyRwLock,
    volume::Volume,
};

/// Bound on rightward B-link walks before the search re-descends; an
/// overrun is reported as corruption.
pub const MAX_WALK_RIGHT: usize = 50;

/// Name of the per-volume directory tree holding tree metadata.
pub const DIRECTORY_TREE_NAME: &str = "_directory";

/// A named ordered map inside a volume. Metadata (root page, depth,
/// change counter) persists in the volume's directory tree; the tree
/// object is the cached, live form.
#[derive(Debug)]
pub struct Tree {
    handle: TreeHandle,
    volume: VolumeHandle,
    name: String,

    root: AtomicU64,
    depth: AtomicU32,
    change_count: AtomicU64,

    /// Key generation: bumped by every structural change; level caches
    /// compare it.
    generation: AtomicU64,
}

impl Tree {
    pub fn new(
        handle: TreeHandle,
        volume: VolumeHandle,
        name: &str,
        root: PageAddress,
        depth: u32,
        change_count: u64,
    ) -> Tree {
        Tree {
            handle,
            volume,
            name: name.to_string(),
            root: AtomicU64::new(root),
            depth: AtomicU32::new(depth),
            change_count: AtomicU64::new(change_count),
            generation: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> TreeHandle {
        self.handle
    }

    pub fn volume(&self) -> VolumeHandle {
        self.volume
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> PageAddress {
        self.root.load(Ordering::Acquire)
    }

    pub fn set_root(&self, root: PageAddress) {
        self.root.store(root, Ordering::Release);
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    pub fn set_depth(&self, depth: u32) {
        self.depth.store(depth, Ordering::Release);
    }

    pub fn change_count(&self) -> u64 {
        self.change_count.load(Ordering::Relaxed)
    }

    pub fn bump_change_count(&self) {
        self.change_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_directory(&self) -> bool {
        self.name == DIRECTORY_TREE_NAME
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Tree {} in volume {}, root {}, depth {}>",
            self.name,
            self.volume,
            self.root(),
            self.depth()
        )
    }
}

/// Persisted form of a tree's metadata inside the directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeMetadata {
    pub root: PageAddress,
    pub depth: u32,
    pub change_count: u64,
}

impl TreeMetadata {
    pub fn encode(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[0..8].copy_from_slice(&self.root.to_be_bytes());
        out[8..12].copy_from_slice(&self.depth.to_be_bytes());
        out[12..20].copy_from_slice(&self.change_count.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> DbResult<TreeMetadata> {
        if bytes.len() != 20 {
            return Err(DbError::corruption("tree metadata record has a bad length"));
        }
        let mut root = [0u8; 8];
        root.copy_from_slice(&bytes[0..8]);
        let mut depth = [0u8; 4];
        depth.copy_from_slice(&bytes[8..12]);
        let mut change_count = [0u8; 8];
        change_count.copy_from_slice(&bytes[12..20]);
        Ok(TreeMetadata {
            root: u64::from_be_bytes(root),
            depth: u32::from_be_bytes(depth),
            change_count: u64::from_be_bytes(change_count),
        })
    }
}

/// Per-level memo of the last descent with a given key; reused without
/// searching when every generation still matches.
struct CachedPath {
    key: Vec<u8>,
    tree_generation: u64,
    leaf: PageAddress,
    leaf_generation: u64,
    position: crate::page::Position,
}

/// Sequential-insert detector feeding the split policy.
struct InsertPattern {
    last_key: Vec<u8>,
    streak: i32,
}

/// A session binds claims, the level cache and the insert-pattern
/// detector to one application thread of control. Cursors own one.
pub struct Session {
    id: SessionId,
    cache: HashMap<TreeHandle, CachedPath>,
    patterns: HashMap<TreeHandle, InsertPattern>,
}

impl Session {
    pub fn new(id: SessionId) -> Session {
        Session {
            id,
            cache: HashMap::new(),
            patterns: HashMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn cache_leaf(
        &mut self,
        tree: &Tree,
        key: &[u8],
        leaf: PageAddress,
        leaf_generation: u64,
        position: crate::page::Position,
    ) {
        self.cache.insert(
            tree.handle(),
            CachedPath {
                key: key.to_vec(),
                tree_generation: tree.generation(),
                leaf,
                leaf_generation,
                position,
            },
        );
    }

    pub(crate) fn cached_leaf(
        &self,
        tree: &Tree,
        key: &[u8],
    ) -> Option<(PageAddress, u64, crate::page::Position)> {
        let c = self.cache.get(&tree.handle())?;
        if c.key != key || c.tree_generation != tree.generation() {
            return None;
        }
        Some((c.leaf, c.leaf_generation, c.position))
    }

    pub(crate) fn drop_cache(&mut self, tree: TreeHandle) {
        self.cache.remove(&tree);
    }

    /// Record an insert and report the split policy the observed
    /// pattern asks for.
    pub(crate) fn observe_insert(&mut self, tree: TreeHandle, key: &[u8]) -> SplitPolicy {
        let entry = self.patterns.entry(tree).or_insert_with(|| InsertPattern {
            last_key: Vec::new(),
            streak: 0,
        });

        if !entry.last_key.is_empty() {
            if key > entry.last_key.as_slice() {
                entry.streak = if entry.streak >= 0 { entry.streak + 1 } else { 1 };
            } else if key < entry.last_key.as_slice() {
                entry.streak = if entry.streak <= 0 { entry.streak - 1 } else { -1 };
            }
        }
        entry.last_key = key.to_vec();

        if entry.streak >= 3 {
            SplitPolicy::ForwardBias
        } else if entry.streak <= -3 {
            SplitPolicy::ReverseBias
        } else {
            SplitPolicy::Even
        }
    }
}

// ----------------------------------------------------------------------
// frame helpers shared by the tree operations

pub(crate) fn get_frame(
    session: &Session,
    volume: &Arc<Volume>,
    page: PageAddress,
    claim: Claim,
    read_if_miss: bool,
) -> DbResult<Pod<Frame>> {
    Database::buffer_pool().get(
        Database::claims(),
        session.id,
        volume,
        page,
        claim,
        read_if_miss,
    )
}

pub(crate) fn release_frame(session: &Session, frame: &Pod<Frame>) {
    Database::buffer_pool().release(Database::claims(), session.id, frame);
}

/// Verify that a frame holds a B-tree page of the expected kind;
/// anything else closes the volume.
pub(crate) fn expect_page_type(
    volume: &Arc<Volume>,
    frame: &Pod<Frame>,
    expected: PageType,
) -> Completion {
    let actual = frame.rl().page.page_type()?;
    if actual != expected {
        return Err(volume.mark_corrupt(&format!(
            "page {} has type {:?}, expected {:?}",
            frame.rl().page.page_address(),
            actual,
            expected
        )));
    }
    Ok(())
}

/// Retry driver: runs the operation with a shared tree claim, and when
/// it signals that it needed stronger claims, releases everything,
/// re-acquires the tree claim exclusively, and restarts from the top.
/// No partial mutation is visible after a retry. The loop bound is the
/// tree depth plus slack; exceeding it is a bug surfaced as
/// corruption.
pub(crate) fn with_retry<T>(
    tree: &Pod<Tree>,
    session: &mut Session,
    mut op: impl FnMut(&mut Session, bool) -> DbResult<T>,
) -> DbResult<T> {
    let (handle, depth) = {
        let t = tree.rl();
        (t.handle(), t.depth())
    };
    let target = ClaimTarget::Tree(handle);
    let claims = Database::claims();
    let _op = Database::enter_op();

    let mut writer = false;
    let bound = depth as usize + 3;
    for _ in 0..bound {
        let claim = if writer { Claim::Exclusive } else { Claim::Shared };
        claims.claim(session.id, target, claim)?;

        match op(session, writer) {
            Ok(value) => {
                claims.release(session.id, target);
                return Ok(value);
            }
            Err(e) if e.is_retry() => {
                debug!("tree {} operation retries with writer claim", handle);
                Database::buffer_pool().release_session_pins(session.id);
                claims.release_all(session.id);
                session.drop_cache(handle);
                writer = true;
            }
            Err(e) => {
                Database::buffer_pool().release_session_pins(session.id);
                claims.release_all(session.id);
                return Err(e);
            }
        }
    }

    Err(DbError::corruption(&format!(
        "retry bound exceeded on tree {}",
        handle
    )))
}
