use std::{
    collections::HashMap,
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{bounded, Sender};
use log::{debug, error, info, warn};

use crate::{
    buffer::{BufferPool, Frame},
    claim::{ClaimTable, CheckpointGuard, OpGuard, OpsGate},
    config::Config,
    error::DbError,
    journal::{manager::JournalManager, recovery},
    key::Key,
    transaction::TransactionRegistry,
    tree::{self, Session, Tree, TreeMetadata, DIRECTORY_TREE_NAME},
    types::{Completion, DbResult, PageAddress, Pod, Timestamp, TreeHandle, VolumeHandle},
    utils::HandyRwLock,
    volume::Volume,
};

struct CopierHandle {
    stop: Sender<()>,
    join: JoinHandle<()>,
}

/// We collect all engine-wide state here: the volume arena, the tree
/// registry, the buffer pool, the journal, the claim table, the
/// transaction registry and the timestamp allocator. Trees hold volume
/// handles, never volume references; the arena resolves them.
pub struct Database {
    config: Config,

    volumes: RwLock<HashMap<VolumeHandle, Arc<Volume>>>,
    trees: RwLock<TreeRegistry>,

    buffer_pool: BufferPool,
    journal: RwLock<JournalManager>,
    claims: ClaimTable,
    tx_registry: RwLock<TransactionRegistry>,

    /// The logical clock. Never a free static: it lives and dies with
    /// the engine instance.
    timestamps: AtomicU64,
    next_session: AtomicU64,

    /// Timestamp of the most recent (pending or completed) checkpoint;
    /// the write-before-release rule compares against it.
    checkpoint_boundary: AtomicU64,

    /// Structural operations enter this gate (reentrantly); a
    /// checkpoint drains it so it only ever snapshots quiescent trees.
    ops_gate: OpsGate,

    stop_flag: AtomicBool,
    copier: Mutex<Option<CopierHandle>>,
}

#[derive(Default)]
struct TreeRegistry {
    by_name: HashMap<(VolumeHandle, String), Pod<Tree>>,
    by_handle: HashMap<TreeHandle, Pod<Tree>>,
}

static mut SINGLETON: *mut Database = 0 as *mut Database;
static SWAP_LOCK: Mutex<()> = Mutex::new(());

impl Database {
    /// Open (or reopen) the engine: run recovery against the journal,
    /// open the configured volumes, replay committed transactions,
    /// checkpoint, and start the copier.
    pub fn init(config: Config) -> Completion {
        let _swap = SWAP_LOCK.lock().unwrap();

        // stop the previous instance first so no background thread
        // straddles the swap
        unsafe {
            if !SINGLETON.is_null() {
                (*SINGLETON).shutdown_inner();
                mem::drop(Box::from_raw(SINGLETON));
                SINGLETON = 0 as *mut Database;
            }
        }
        let instance = Database {
            buffer_pool: BufferPool::new(config.buffer_counts.clone()),
            journal: RwLock::new(JournalManager::new(
                config.journal_path.clone(),
                config.journal_size,
                config.read_only,
            )),
            claims: ClaimTable::new(),
            tx_registry: RwLock::new(TransactionRegistry::new()),
            volumes: RwLock::new(HashMap::new()),
            trees: RwLock::new(TreeRegistry::default()),
            timestamps: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
            checkpoint_boundary: AtomicU64::new(0),
            ops_gate: OpsGate::new(),
            stop_flag: AtomicBool::new(false),
            copier: Mutex::new(None),
            config,
        };

        unsafe {
            SINGLETON = mem::transmute(Box::new(instance));
        }

        Self::global().bootstrap()
    }

    pub fn global() -> &'static Database {
        unsafe {
            SINGLETON
                .as_ref()
                .expect("Database::init must run before any engine call")
        }
    }

    pub fn is_initialized() -> bool {
        unsafe { !SINGLETON.is_null() }
    }

    fn bootstrap(&'static self) -> Completion {
        // phase 1: plan — keystone selection and map reconstruction
        let plan = recovery::plan(&self.config.journal_path, self.config.journal_size)?;
        let mut max_timestamp = 1;

        if let Some(plan) = &plan {
            max_timestamp = max_timestamp.max(plan.max_timestamp);
            self.journal.wl().seed_from_recovery(
                plan.block_size,
                plan.base_address,
                plan.page_map.clone(),
                plan.tx_map.clone(),
                plan.volumes.clone(),
                plan.trees.clone(),
                plan.checkpoint_timestamp,
                plan.keystone_generation + 1,
            );
            info!(
                "recovery plan: keystone generation {}, checkpoint ts {}, {} committed transactions to replay",
                plan.keystone_generation,
                plan.checkpoint_timestamp,
                plan.committed_count()
            );
        } else {
            info!("no journal found; starting a fresh installation");
        }

        if !self.config.read_only {
            self.journal.wl().start_new_generation()?;
        }

        // open the configured volumes and identify them to the journal
        for spec in self.config.volumes.clone() {
            let handle = self.journal.wl().reserve_volume_handle(&spec.name());
            let volume = Volume::open(handle, &spec, self.config.read_only)?;
            max_timestamp = max_timestamp.max(volume.head_timestamp());
            if self.config.append_only {
                volume.set_append_only(true);
            }
            self.journal.wl().identify_volume(&volume)?;
            self.volumes.wl().insert(handle, Arc::new(volume));
        }

        self.timestamps.store(max_timestamp + 1, Ordering::Release);
        if let Some(plan) = &plan {
            self.checkpoint_boundary
                .store(plan.checkpoint_timestamp, Ordering::Release);

            // the on-disk head pages may predate the allocations the
            // journal knows about; no journal-resident page may ever
            // be handed out again
            for key in self.journal.rl().page_map().keys() {
                if let Some(volume) = self.volumes.rl().get(&key.volume) {
                    volume.reserve_through(key.page)?;
                }
            }
        }

        // phase 2: apply — replay committed transactions through the
        // default recovery listener
        if let Some(plan) = plan {
            if self.config.read_only {
                if plan.committed_count() > 0 {
                    return Err(DbError::validation(
                        "read-only open requires a journal with no unapplied transactions",
                    ));
                }
            } else {
                recovery::apply(&plan, &recovery::DefaultRecoveryListener)?;
            }
        }

        if !self.config.read_only {
            Self::checkpoint()?;
            self.start_copier();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // accessors

    pub fn config() -> &'static Config {
        &Self::global().config
    }

    pub fn claims() -> &'static ClaimTable {
        &Self::global().claims
    }

    pub fn buffer_pool() -> &'static BufferPool {
        &Self::global().buffer_pool
    }

    pub fn journal() -> RwLockReadGuard<'static, JournalManager> {
        Self::global().journal.rl()
    }

    pub fn mut_journal() -> RwLockWriteGuard<'static, JournalManager> {
        Self::global().journal.wl()
    }

    pub fn tx_registry() -> RwLockReadGuard<'static, TransactionRegistry> {
        Self::global().tx_registry.rl()
    }

    pub fn mut_tx_registry() -> RwLockWriteGuard<'static, TransactionRegistry> {
        Self::global().tx_registry.wl()
    }

    pub fn volume(handle: VolumeHandle) -> DbResult<Arc<Volume>> {
        Self::global()
            .volumes
            .rl()
            .get(&handle)
            .cloned()
            .ok_or_else(|| DbError::validation(&format!("no volume with handle {}", handle)))
    }

    pub fn volume_by_name(name: &str) -> DbResult<Arc<Volume>> {
        Self::global()
            .volumes
            .rl()
            .values()
            .find(|v| v.name() == name)
            .cloned()
            .ok_or_else(|| DbError::validation(&format!("no volume named {}", name)))
    }

    pub fn volumes() -> Vec<Arc<Volume>> {
        let mut volumes: Vec<Arc<Volume>> = Self::global().volumes.rl().values().cloned().collect();
        volumes.sort_by_key(|v| v.handle());
        volumes
    }

    pub fn allocate_timestamp() -> Timestamp {
        Self::global().timestamps.fetch_add(1, Ordering::AcqRel)
    }

    pub fn current_timestamp() -> Timestamp {
        Self::global().timestamps.load(Ordering::Acquire)
    }

    pub fn new_session() -> Session {
        let id = Self::global().next_session.fetch_add(1, Ordering::Relaxed);
        Session::new(id)
    }

    pub fn release_session(session: &mut Session) {
        Self::global().buffer_pool.release_session_pins(session.id());
        Self::global().claims.release_all(session.id());
    }

    pub fn stop_requested() -> bool {
        Self::global().stop_flag.load(Ordering::Acquire)
    }

    /// Every structural operation enters this gate; the checkpoint
    /// drains it before it snapshots.
    pub(crate) fn enter_op() -> OpGuard<'static> {
        Self::global().ops_gate.enter_op()
    }

    pub(crate) fn enter_checkpoint() -> CheckpointGuard<'static> {
        Self::global().ops_gate.enter_checkpoint()
    }

    // ------------------------------------------------------------------
    // trees

    /// Resolve (or create) a named tree in a volume. Metadata lives in
    /// the volume's directory tree.
    pub fn get_tree(volume: VolumeHandle, name: &str, create: bool) -> DbResult<Pod<Tree>> {
        if name == DIRECTORY_TREE_NAME {
            return Self::directory_tree(volume);
        }
        if let Some(tree) = Self::global()
            .trees
            .rl()
            .by_name
            .get(&(volume, name.to_string()))
        {
            return Ok(tree.clone());
        }

        let directory = Self::directory_tree(volume)?;
        let mut session = Self::new_session();
        let mut key = Key::new();
        key.append(name.as_bytes())?;

        let metadata = tree::search::fetch(&directory, &mut session, &key, 0)?
            .map(|bytes| TreeMetadata::decode(&bytes))
            .transpose()?;

        let metadata = match metadata {
            Some(m) => m,
            None => {
                if !create {
                    Self::release_session(&mut session);
                    return Err(DbError::validation(&format!(
                        "no tree named {} in volume {}",
                        name, volume
                    )));
                }
                let m = Self::create_tree_storage(volume, &mut session)?;
                let encoded = m.encode();
                tree::store::store_raw(&directory, &mut session, &key, &encoded, 0)?;
                m
            }
        };

        let handle = Self::mut_journal().identify_tree(volume, name)?;
        let tree = Arc::new(RwLock::new(Tree::new(
            handle,
            volume,
            name,
            metadata.root,
            metadata.depth,
            metadata.change_count,
        )));

        let mut registry = Self::global().trees.wl();
        registry
            .by_name
            .insert((volume, name.to_string()), tree.clone());
        registry.by_handle.insert(handle, tree.clone());
        drop(registry);

        Self::buffer_pool().set_fixed(
            crate::types::PageKey::new(volume, metadata.root),
            true,
        );
        Self::release_session(&mut session);
        debug!("tree {} (handle {}) opened in volume {}", name, handle, volume);
        Ok(tree)
    }

    fn create_tree_storage(volume: VolumeHandle, session: &mut Session) -> DbResult<TreeMetadata> {
        let vol = Self::volume(volume)?;
        if vol.is_read_only() {
            return Err(DbError::validation("cannot create a tree in a read-only volume"));
        }

        let root = tree::alloc::allocate_page(session, &vol)?;
        let ts = Self::allocate_timestamp();
        let frame = Self::buffer_pool().get(
            Self::claims(),
            session.id(),
            &vol,
            root,
            crate::claim::Claim::Exclusive,
            false,
        )?;
        {
            let mut f = frame.wl();
            f.page.init_as(crate::page::PageType::Data, root);
            f.mark_dirty(ts);
            f.bump_generation();
        }
        Self::buffer_pool().release(Self::claims(), session.id(), &frame);

        Ok(TreeMetadata {
            root,
            depth: 1,
            change_count: 0,
        })
    }

    /// The per-volume directory tree, bootstrapped from the head page.
    pub fn directory_tree(volume: VolumeHandle) -> DbResult<Pod<Tree>> {
        if let Some(tree) = Self::global()
            .trees
            .rl()
            .by_name
            .get(&(volume, DIRECTORY_TREE_NAME.to_string()))
        {
            return Ok(tree.clone());
        }

        let vol = Self::volume(volume)?;
        let mut session = Self::new_session();

        let (root, fresh) = match vol.directory_root() {
            0 => {
                let metadata = Self::create_tree_storage(volume, &mut session)?;
                vol.set_directory_root(metadata.root);
                (metadata.root, true)
            }
            root => (root, false),
        };

        let depth = if fresh {
            1
        } else {
            Self::derive_depth(&session, &vol, root)?
        };

        let handle = Self::mut_journal().identify_tree(volume, DIRECTORY_TREE_NAME)?;
        let tree = Arc::new(RwLock::new(Tree::new(
            handle,
            volume,
            DIRECTORY_TREE_NAME,
            root,
            depth,
            0,
        )));

        let mut registry = Self::global().trees.wl();
        registry
            .by_name
            .insert((volume, DIRECTORY_TREE_NAME.to_string()), tree.clone());
        registry.by_handle.insert(handle, tree.clone());
        drop(registry);

        Self::buffer_pool().set_fixed(crate::types::PageKey::new(volume, root), true);
        Self::release_session(&mut session);
        Ok(tree)
    }

    /// The directory tree's depth is not in the head page; derive it
    /// by walking leftmost children down to a data page.
    fn derive_depth(session: &Session, volume: &Arc<Volume>, root: PageAddress) -> DbResult<u32> {
        let mut depth = 1;
        let mut page = root;
        loop {
            let frame = Self::buffer_pool().get(
                Self::claims(),
                session.id(),
                volume,
                page,
                crate::claim::Claim::Shared,
                true,
            )?;
            let next = (|| {
                let f = frame.rl();
                match f.page.page_type()? {
                    crate::page::PageType::Data => Ok(None),
                    crate::page::PageType::Index => Ok(Some(f.page.child_at(0)?)),
                    other => Err(volume.mark_corrupt(&format!(
                        "directory page {} has type {:?}",
                        page, other
                    ))),
                }
            })();
            Self::buffer_pool().release(Self::claims(), session.id(), &frame);
            match next? {
                Some(child) => {
                    depth += 1;
                    page = child;
                }
                None => return Ok(depth),
            }
        }
    }

    pub fn tree_by_handle(handle: TreeHandle) -> DbResult<Pod<Tree>> {
        if let Some(tree) = Self::global().trees.rl().by_handle.get(&handle) {
            return Ok(tree.clone());
        }
        // recovery replays against trees known only through IT records
        let info = Self::journal()
            .tree_info(handle)
            .cloned()
            .ok_or_else(|| DbError::validation(&format!("no tree with handle {}", handle)))?;
        Self::get_tree(info.volume_handle, &info.name, true)
    }

    /// Names of the trees a volume holds (the directory tree itself is
    /// not listed).
    pub fn tree_names(volume: VolumeHandle) -> DbResult<Vec<String>> {
        let directory = Self::directory_tree(volume)?;
        let mut session = Self::new_session();
        let mut names = Vec::new();

        let mut key = Key::left_edge();
        loop {
            match tree::traverse::traverse(
                &directory,
                &mut session,
                &mut key,
                crate::key::Direction::Gt,
                true,
                None,
                0,
            )? {
                Some(_) => {
                    if let Some(segment) = key.segments().first() {
                        names.push(String::from_utf8_lossy(segment).to_string());
                    }
                }
                None => break,
            }
        }
        Self::release_session(&mut session);
        Ok(names)
    }

    /// Remove a tree: free every page it owns (long-record chains
    /// included), then drop its directory entry.
    pub fn remove_tree(volume: VolumeHandle, name: &str, session: &mut Session) -> Completion {
        let tree = Self::get_tree(volume, name, false)?;
        if tree.rl().is_directory() {
            return Err(DbError::validation("the directory tree cannot be removed"));
        }
        let vol = Self::volume(volume)?;

        // empty the tree through the ordinary range machinery, which
        // returns freed pages and chains to the garbage list
        tree::remove::remove_key_range(&tree, session, &Key::left_edge(), &Key::right_edge())?;

        // the shrunken root is a single empty data page now
        let root = tree.rl().root();
        Self::buffer_pool().set_fixed(crate::types::PageKey::new(volume, root), false);
        tree::alloc::deallocate_page(session, &vol, root)?;

        let directory = Self::directory_tree(volume)?;
        let mut key = Key::new();
        key.append(name.as_bytes())?;
        tree::remove::remove(&directory, session, &key)?;

        let handle = tree.rl().handle();
        let mut registry = Self::global().trees.wl();
        registry.by_name.remove(&(volume, name.to_string()));
        registry.by_handle.remove(&handle);
        drop(registry);

        info!("tree {} removed from volume {}", name, volume);
        Ok(())
    }

    pub fn remove_tree_by_handle(handle: TreeHandle, session: &mut Session) -> Completion {
        let info = Self::journal()
            .tree_info(handle)
            .cloned()
            .ok_or_else(|| DbError::validation(&format!("no tree with handle {}", handle)))?;
        Self::remove_tree(info.volume_handle, &info.name, session)
    }

    /// Persist a tree's metadata: directory trees anchor in the head
    /// page, ordinary trees in the volume's directory tree.
    pub fn save_tree_metadata(tree: &Pod<Tree>, session: &mut Session) -> Completion {
        let (volume, name, root, depth, change_count, directory) = {
            let t = tree.rl();
            (
                t.volume(),
                t.name().to_string(),
                t.root(),
                t.depth(),
                t.change_count(),
                t.is_directory(),
            )
        };

        if directory {
            Self::volume(volume)?.set_directory_root(root);
            return Ok(());
        }

        let metadata = TreeMetadata {
            root,
            depth,
            change_count,
        };
        let directory_tree = Self::directory_tree(volume)?;
        let mut key = Key::new();
        key.append(name.as_bytes())?;
        tree::store::store_raw(&directory_tree, session, &key, &metadata.encode(), 0)
    }

    // ------------------------------------------------------------------
    // checkpoint and copier

    /// Before a frame is mutated by an operation whose timestamp
    /// crosses the pending checkpoint boundary, its prior content must
    /// first be journaled.
    pub fn write_page_on_checkpoint(frame: &Pod<Frame>, ts: Timestamp) -> Completion {
        let boundary = Self::global().checkpoint_boundary.load(Ordering::Acquire);
        if boundary == 0 || ts <= boundary {
            return Ok(());
        }

        let mut f = frame.wl();
        if f.is_dirty() && f.dirty_at() <= boundary && f.last_journaled() < boundary {
            let key = match f.key() {
                Some(k) => k,
                None => return Ok(()),
            };
            let page_ts = f.page.timestamp();
            Self::mut_journal().write_page(key, page_ts, f.page.bytes())?;
            f.mark_journaled(page_ts);
        }
        Ok(())
    }

    /// Checkpoint: quiesce structural operations, journal every dirty
    /// frame at or before the checkpoint timestamp, fold the volatile
    /// scalars into the volume heads, then append the `CP` record and
    /// force.
    pub fn checkpoint() -> Completion {
        let db = Self::global();
        let _gate = Self::enter_checkpoint();

        let ts = Self::allocate_timestamp();
        db.checkpoint_boundary.store(ts, Ordering::Release);

        // dirty frames in dirty-at order keeps journal offsets a
        // serializable history of page mutations
        for pod in db.buffer_pool.dirty_frames() {
            let mut f = pod.wl();
            if !f.is_dirty() || f.dirty_at() > ts {
                continue;
            }
            let key = match f.key() {
                Some(k) => k,
                None => continue,
            };
            let page_ts = f.page.timestamp();
            Self::mut_journal().write_page(key, page_ts, f.page.bytes())?;
            f.mark_journaled(page_ts);
        }

        for volume in Self::volumes() {
            if volume.is_closed() {
                continue;
            }
            volume.set_head_timestamp(Self::current_timestamp());
            if let Err(e) = volume.sync_head() {
                warn!("head sync of volume {} failed: {}", volume.name(), e);
            }
        }

        Self::mut_journal().checkpoint(ts)?;
        Self::mut_tx_registry().prune(ts);
        Ok(())
    }

    fn start_copier(&'static self) {
        let (stop, ticker) = bounded::<()>(1);
        let join = std::thread::Builder::new()
            .name("vellum-copier".to_string())
            .spawn(move || loop {
                match ticker.recv_timeout(Duration::from_millis(250)) {
                    Ok(()) => break,
                    Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                }
                if !Database::is_initialized() || Database::stop_requested() {
                    break;
                }
                if let Err(e) = Database::copier_pass(64) {
                    error!("copier pass failed: {}", e);
                }
            })
            .expect("copier thread");

        *self.copier.lock().unwrap() = Some(CopierHandle { stop, join });
        debug!("copier started");
    }

    /// One explicit copier pass; the background thread calls this on
    /// its tick, tests call it directly.
    pub fn copier_pass(max_pages: usize) -> DbResult<usize> {
        let resolve = |handle: VolumeHandle| Database::volume(handle).ok();
        Self::mut_journal().copier_pass(max_pages, &resolve)
    }

    /// Freeze (or thaw) all volume writes; the journal keeps accepting
    /// records. Backup runs between `true` and `false`.
    pub fn set_append_only(value: bool) {
        for volume in Self::volumes() {
            volume.set_append_only(value);
        }
        info!(
            "append-only mode {}",
            if value { "entered" } else { "left" }
        );
    }

    fn shutdown_inner(&self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.copier.lock().unwrap().take() {
            let _ = handle.stop.send(());
            let _ = handle.join.join();
        }
    }

    /// Clean shutdown: final checkpoint, `JE` record, volume close.
    /// Reopen after this replays nothing.
    pub fn close() -> Completion {
        let db = Self::global();
        db.shutdown_inner();

        if !db.config.read_only {
            Self::checkpoint()?;
            Self::mut_journal().close()?;
        }
        for volume in Self::volumes() {
            if let Err(e) = volume.close() {
                warn!("closing volume {}: {}", volume.name(), e);
            }
        }
        info!("database closed");
        Ok(())
    }
}
