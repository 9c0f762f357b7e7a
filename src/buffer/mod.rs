use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use log::{debug, trace};

use crate::{
    claim::{Claim, ClaimTable, ClaimTarget},
    config::DEFAULT_BUFFER_COUNT,
    error::DbError,
    page::Page,
    types::{Completion, DbResult, PageKey, Pod, SessionId, Timestamp},
    utils::HandyRwLock,
    volume::Volume,
};

/// One buffer frame. The frame's bytes are guarded by the pod's
/// `RwLock`; the logical reader/writer claim lives in the claim table
/// keyed by the frame's `PageKey`.
pub struct Frame {
    key: Option<PageKey>,
    pub page: Page,

    valid: bool,
    dirty: bool,
    /// Logical time of the earliest modification not yet journaled.
    dirty_at: Timestamp,
    /// Timestamp carried by the last journal write of this frame.
    last_journaled: Timestamp,
    /// Pinned forever (head pages, tree roots); never a victim.
    fixed: bool,
    /// Bumped on every structural change and on rebinding; level
    /// caches compare it.
    generation: u64,
}

impl Frame {
    fn new(page_size: usize) -> Frame {
        Frame {
            key: None,
            page: Page::new(page_size),
            valid: false,
            dirty: false,
            dirty_at: 0,
            last_journaled: 0,
            fixed: false,
            generation: 0,
        }
    }

    pub fn key(&self) -> Option<PageKey> {
        self.key
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn dirty_at(&self) -> Timestamp {
        self.dirty_at
    }

    pub fn last_journaled(&self) -> Timestamp {
        self.last_journaled
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }

    pub fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    /// Record a modification at logical time `ts`. The dirty-at
    /// timestamp keeps the time of the *earliest* unjournaled change.
    pub fn mark_dirty(&mut self, ts: Timestamp) {
        if !self.dirty {
            self.dirty = true;
            self.dirty_at = ts;
        }
        self.page.set_timestamp(ts);
    }

    pub fn mark_journaled(&mut self, ts: Timestamp) {
        self.dirty = false;
        self.last_journaled = ts;
        self.dirty_at = 0;
    }
}

struct SubPool {
    page_size: usize,
    capacity: usize,
    frames: Vec<Pod<Frame>>,
    pins: Vec<usize>,
    referenced: Vec<bool>,
    lookup: HashMap<PageKey, usize>,
    clock_hand: usize,
}

impl SubPool {
    fn new(page_size: usize, capacity: usize) -> SubPool {
        SubPool {
            page_size,
            capacity: capacity.max(4),
            frames: Vec::new(),
            pins: Vec::new(),
            referenced: Vec::new(),
            lookup: HashMap::new(),
            clock_hand: 0,
        }
    }

    /// Pick a frame for a new page: grow until the fixed count is
    /// reached, then run the clock over unpinned, unfixed frames.
    fn victim(&mut self) -> DbResult<usize> {
        if self.frames.len() < self.capacity {
            let index = self.frames.len();
            self.frames
                .push(Arc::new(RwLock::new(Frame::new(self.page_size))));
            self.pins.push(0);
            self.referenced.push(false);
            return Ok(index);
        }

        let len = self.frames.len();
        for _ in 0..3 * len {
            let index = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % len;

            if self.pins[index] > 0 {
                continue;
            }
            if self.frames[index].rl().fixed {
                continue;
            }
            if self.referenced[index] {
                self.referenced[index] = false;
                continue;
            }
            return Ok(index);
        }

        Err(DbError::exhausted(&format!(
            "no evictable buffer frame among {} of size {}",
            len, self.page_size
        )))
    }
}

/// Fixed-size frame cache shared by all volumes, one sub-pool per page
/// size. Lookup is a hash on (volume handle, page address).
pub struct BufferPool {
    pools: Mutex<HashMap<usize, SubPool>>,
    session_pins: Mutex<HashMap<SessionId, Vec<PageKey>>>,
    buffer_counts: HashMap<usize, usize>,
}

impl BufferPool {
    pub fn new(buffer_counts: HashMap<usize, usize>) -> BufferPool {
        BufferPool {
            pools: Mutex::new(HashMap::new()),
            session_pins: Mutex::new(HashMap::new()),
            buffer_counts,
        }
    }

    /// Retrieve the frame holding the given page with the requested
    /// claim, loading the page on a miss.
    ///
    /// - if resident: acquire the claim, pin, revalidate, return;
    /// - if not: choose a victim by LRU-clock among unpinned frames,
    ///   journal it first when dirty, then (with `read_if_miss`) load
    ///   the page image, preferring the journal's page map over the
    ///   volume file.
    pub fn get(
        &self,
        claims: &ClaimTable,
        session: SessionId,
        volume: &Arc<Volume>,
        page: u64,
        claim: Claim,
        read_if_miss: bool,
    ) -> DbResult<Pod<Frame>> {
        let key = PageKey::new(volume.handle(), page);
        claims.claim(session, ClaimTarget::Page(key), claim)?;

        let result = self.get_pinned(volume, key, read_if_miss);
        match result {
            Ok(_) => {
                self.session_pins
                    .lock()
                    .unwrap()
                    .entry(session)
                    .or_insert_with(Vec::new)
                    .push(key);
            }
            Err(_) => {
                claims.release(session, ClaimTarget::Page(key));
            }
        }
        result
    }

    fn get_pinned(
        &self,
        volume: &Arc<Volume>,
        key: PageKey,
        read_if_miss: bool,
    ) -> DbResult<Pod<Frame>> {
        let mut pools = self.pools.lock().unwrap();
        let page_size = volume.page_size();
        let capacity = self
            .buffer_counts
            .get(&page_size)
            .copied()
            .unwrap_or(DEFAULT_BUFFER_COUNT);
        let pool = pools
            .entry(page_size)
            .or_insert_with(|| SubPool::new(page_size, capacity));

        if let Some(&index) = pool.lookup.get(&key) {
            pool.pins[index] += 1;
            pool.referenced[index] = true;
            trace!("buffer hit {:?}", key);
            return Ok(pool.frames[index].clone());
        }

        // miss: evict, rebind, load
        let index = pool.victim()?;
        let pod = pool.frames[index].clone();

        {
            let mut frame = pod.wl();
            if let Some(old_key) = frame.key {
                if frame.dirty {
                    // write-before-release: the journal gets the image
                    // before the frame is reused
                    let ts = frame.page.timestamp();
                    crate::database::Database::mut_journal().write_page(
                        old_key,
                        ts,
                        frame.page.bytes(),
                    )?;
                    frame.mark_journaled(ts);
                }
                pool.lookup.remove(&old_key);
                debug!("evicted {:?} for {:?}", old_key, key);
            }

            frame.key = Some(key);
            frame.valid = false;
            frame.dirty = false;
            frame.bump_generation();

            if read_if_miss {
                // the page map is authoritative; the volume file is a
                // lazy projection
                let journal_addr =
                    crate::database::Database::journal().lookup_page(key);
                let bytes = match journal_addr {
                    Some(addr) => {
                        crate::database::Database::journal().read_page_image(addr, page_size)?
                    }
                    None => volume.read_page(key.page)?,
                };
                frame.page.replace_bytes(bytes);
                frame.valid = true;
            } else {
                frame.page.init_as(crate::page::PageType::Unallocated, key.page);
                frame.valid = true;
            }
        }

        pool.lookup.insert(key, index);
        pool.pins[index] += 1;
        pool.referenced[index] = true;
        Ok(pod)
    }

    /// Unpin a frame and surrender its claim. Ownership of a frame is
    /// transferred by claim, never by pointer handoff.
    pub fn release(&self, claims: &ClaimTable, session: SessionId, frame: &Pod<Frame>) {
        let key = frame.rl().key;
        if let Some(key) = key {
            self.unpin(key);
            claims.release(session, ClaimTarget::Page(key));
            let mut pins = self.session_pins.lock().unwrap();
            if let Some(list) = pins.get_mut(&session) {
                if let Some(i) = list.iter().position(|k| *k == key) {
                    list.swap_remove(i);
                }
                if list.is_empty() {
                    pins.remove(&session);
                }
            }
        }
    }

    /// Drop every pin a session still holds; the retry driver calls
    /// this together with the claim table's `release_all` so that no
    /// partial operation leaves frames unevictable.
    pub fn release_session_pins(&self, session: SessionId) {
        let keys = self
            .session_pins
            .lock()
            .unwrap()
            .remove(&session)
            .unwrap_or_default();
        for key in keys {
            self.unpin(key);
        }
    }

    fn unpin(&self, key: PageKey) {
        let mut pools = self.pools.lock().unwrap();
        for pool in pools.values_mut() {
            if let Some(&index) = pool.lookup.get(&key) {
                if pool.pins[index] > 0 {
                    pool.pins[index] -= 1;
                }
                return;
            }
        }
    }

    /// Snapshot of every dirty frame, oldest modification first, so
    /// the journal's offsets order the page mutation history.
    pub fn dirty_frames(&self) -> Vec<Pod<Frame>> {
        let pools = self.pools.lock().unwrap();
        let mut dirty: Vec<(Timestamp, Pod<Frame>)> = Vec::new();
        for pool in pools.values() {
            for pod in pool.frames.iter() {
                let frame = pod.rl();
                if frame.valid && frame.dirty {
                    dirty.push((frame.dirty_at, pod.clone()));
                }
            }
        }
        dirty.sort_by_key(|(ts, _)| *ts);
        dirty.into_iter().map(|(_, pod)| pod).collect()
    }

    /// Pin a page's frame into the pool permanently (tree roots) or
    /// release it back to the clock.
    pub fn set_fixed(&self, key: PageKey, fixed: bool) {
        let pools = self.pools.lock().unwrap();
        for pool in pools.values() {
            if let Some(&index) = pool.lookup.get(&key) {
                pool.frames[index].wl().set_fixed(fixed);
                return;
            }
        }
    }

    /// Drop a page from the cache (tree removal, rollback).
    pub fn discard(&self, key: PageKey) {
        let mut pools = self.pools.lock().unwrap();
        for pool in pools.values_mut() {
            if let Some(index) = pool.lookup.remove(&key) {
                let mut frame = pool.frames[index].wl();
                frame.key = None;
                frame.valid = false;
                frame.dirty = false;
                return;
            }
        }
    }

    /// Invalidate every frame of a volume (volume close).
    pub fn invalidate_volume(&self, volume: crate::types::VolumeHandle) -> Completion {
        let mut pools = self.pools.lock().unwrap();
        for pool in pools.values_mut() {
            let keys: Vec<PageKey> = pool
                .lookup
                .keys()
                .filter(|k| k.volume == volume)
                .copied()
                .collect();
            for key in keys {
                if let Some(index) = pool.lookup.remove(&key) {
                    if pool.pins[index] > 0 {
                        return Err(DbError::exhausted(&format!(
                            "frame {:?} still pinned while invalidating volume",
                            key
                        )));
                    }
                    let mut frame = pool.frames[index].wl();
                    frame.key = None;
                    frame.valid = false;
                    frame.dirty = false;
                }
            }
        }
        Ok(())
    }

    pub fn frame_count(&self) -> usize {
        self.pools
            .lock()
            .unwrap()
            .values()
            .map(|p| p.frames.len())
            .sum()
    }
}
