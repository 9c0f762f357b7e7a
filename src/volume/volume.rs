use std::{
    collections::hash_map::DefaultHasher,
    fs::{File, OpenOptions},
    hash::{Hash, Hasher},
    io::{Read, Seek, SeekFrom, Write},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, MutexGuard, RwLock,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};

use super::head::HeadPage;
use crate::{
    config::VolumeSpec,
    error::DbError,
    types::{Completion, DbResult, PageAddress, VolumeHandle},
    utils::HandyRwLock,
};

/// An open volume: a file of fixed-size pages with a pinned head page.
///
/// Two volatile scalars shadow their head-page fields between
/// checkpoints: `next_available_page` (one past the highest page ever
/// allocated) and `extended_page_count` (the current file length in
/// pages). The head page itself is rewritten only at checkpoints and
/// on extension.
pub struct Volume {
    handle: VolumeHandle,
    name: String,
    spec: VolumeSpec,
    id: u64,
    page_size: usize,

    file: Mutex<File>,
    head: RwLock<HeadPage>,

    next_available_page: AtomicU64,
    extended_page_count: AtomicU64,

    read_counter: AtomicU64,
    write_counter: AtomicU64,

    read_only: bool,
    append_only: AtomicBool,

    /// Set when corruption is detected; every further operation on the
    /// volume fails fast until it is reopened.
    closed: AtomicBool,

    last_error: Mutex<Option<String>>,

    /// Serializes pop/push on the garbage chain.
    garbage_lock: Mutex<()>,
}

impl Volume {
    /// Create or open the volume described by `spec`.
    pub fn open(handle: VolumeHandle, spec: &VolumeSpec, engine_read_only: bool) -> DbResult<Volume> {
        let exists = spec.path.exists();
        if !exists && !(spec.create || spec.create_only) {
            return Err(DbError::validation(&format!(
                "volume {} does not exist",
                spec.path.display()
            )));
        }
        if exists && spec.create_only {
            return Err(DbError::validation(&format!(
                "volume {} already exists",
                spec.path.display()
            )));
        }

        let read_only = engine_read_only || spec.read_only;
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!exists)
            .open(&spec.path)?;
        lock_volume_file(&file, !read_only)?;

        if exists {
            Self::load(handle, spec, file, read_only)
        } else {
            Self::create(handle, spec, file, read_only)
        }
    }

    fn create(
        handle: VolumeHandle,
        spec: &VolumeSpec,
        mut file: File,
        read_only: bool,
    ) -> DbResult<Volume> {
        if read_only {
            return Err(DbError::validation("cannot create a read-only volume"));
        }

        let mut hasher = DefaultHasher::new();
        spec.path.hash(&mut hasher);
        SystemTime::now().hash(&mut hasher);
        let id = hasher.finish();

        let mut head = HeadPage::create(spec.page_size, id, spec.initial_pages);
        head.set_extension_pages(spec.extension_pages);
        head.set_maximum_pages(spec.maximum_pages);

        // size the file to its initial extent; one zero byte at the end
        // materializes the length
        let length = spec.initial_pages * spec.page_size as u64;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(head.bytes())?;
        if length > spec.page_size as u64 {
            file.seek(SeekFrom::Start(length - 1))?;
            file.write_all(&[0u8])?;
        }
        file.sync_all()?;

        info!(
            "created volume {} (id {:x}, page size {}, {} initial pages)",
            spec.path.display(),
            id,
            spec.page_size,
            spec.initial_pages
        );

        Ok(Volume {
            handle,
            name: spec.name(),
            spec: spec.clone(),
            id,
            page_size: spec.page_size,
            file: Mutex::new(file),
            head: RwLock::new(head),
            next_available_page: AtomicU64::new(1),
            extended_page_count: AtomicU64::new(spec.initial_pages),
            read_counter: AtomicU64::new(0),
            write_counter: AtomicU64::new(0),
            read_only,
            append_only: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            garbage_lock: Mutex::new(()),
        })
    }

    fn load(
        handle: VolumeHandle,
        spec: &VolumeSpec,
        mut file: File,
        read_only: bool,
    ) -> DbResult<Volume> {
        let mut probe = vec![0u8; 24];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut probe)
            .map_err(|_| DbError::corruption("volume too short for a head page"))?;
        let page_size =
            u32::from_be_bytes([probe[20], probe[21], probe[22], probe[23]]) as usize;
        if !crate::config::VALID_PAGE_SIZES.contains(&page_size) {
            return Err(DbError::corruption(&format!(
                "bad page size in head page: {}",
                page_size
            )));
        }

        let mut bytes = vec![0u8; page_size];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut bytes)
            .map_err(|_| DbError::corruption("volume too short for a head page"))?;
        let head = HeadPage::from_bytes(bytes)?;

        let file_pages = file.metadata()?.len() / page_size as u64;
        let extended = head.page_count().max(file_pages).max(1);

        debug!(
            "opened volume {} (id {:x}, {} pages, next available {})",
            spec.path.display(),
            head.volume_id(),
            extended,
            head.next_available_page()
        );

        Ok(Volume {
            handle,
            name: spec.name(),
            spec: spec.clone(),
            id: head.volume_id(),
            page_size,
            next_available_page: AtomicU64::new(head.next_available_page().max(1)),
            extended_page_count: AtomicU64::new(extended),
            read_counter: AtomicU64::new(head.read_counter()),
            write_counter: AtomicU64::new(head.write_counter()),
            file: Mutex::new(file),
            head: RwLock::new(head),
            read_only,
            append_only: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            garbage_lock: Mutex::new(()),
        })
    }

    /// Guard held across a pop or push on the garbage chain.
    pub fn lock_garbage_chain(&self) -> MutexGuard<'_, ()> {
        self.garbage_lock.lock().unwrap()
    }

    pub fn handle(&self) -> VolumeHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &std::path::Path {
        &self.spec.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_append_only(&self) -> bool {
        self.append_only.load(Ordering::Acquire)
    }

    /// Freeze/unfreeze volume writes (backup mode). Journal appends
    /// continue; the copier and head updates stand down.
    pub fn set_append_only(&self, value: bool) {
        self.append_only.store(value, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn next_available_page(&self) -> PageAddress {
        self.next_available_page.load(Ordering::Acquire)
    }

    pub fn extended_page_count(&self) -> u64 {
        self.extended_page_count.load(Ordering::Acquire)
    }

    pub fn maximum_pages(&self) -> u64 {
        self.head.rl().maximum_pages()
    }

    pub fn read_counter(&self) -> u64 {
        self.read_counter.load(Ordering::Relaxed)
    }

    pub fn write_counter(&self) -> u64 {
        self.write_counter.load(Ordering::Relaxed)
    }

    pub fn directory_root(&self) -> PageAddress {
        self.head.rl().directory_root()
    }

    pub fn set_directory_root(&self, root: PageAddress) {
        self.head.wl().set_directory_root(root);
    }

    pub fn garbage_root(&self) -> PageAddress {
        self.head.rl().garbage_root()
    }

    pub fn set_garbage_root(&self, root: PageAddress) {
        self.head.wl().set_garbage_root(root);
    }

    pub fn head_timestamp(&self) -> u64 {
        self.head.rl().timestamp()
    }

    pub fn set_head_timestamp(&self, ts: u64) {
        self.head.wl().set_timestamp(ts);
    }

    fn check_open(&self) -> Completion {
        if self.is_closed() {
            let detail = self
                .last_error
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "volume closed".to_string());
            return Err(DbError::corruption(&format!(
                "volume {} is closed: {}",
                self.name, detail
            )));
        }
        Ok(())
    }

    /// Record a corruption and close the volume; all further
    /// operations fail fast until reopen.
    pub fn mark_corrupt(&self, msg: &str) -> DbError {
        warn!("volume {} marked corrupt: {}", self.name, msg);
        *self.last_error.lock().unwrap() = Some(msg.to_string());
        self.closed.store(true, Ordering::Release);
        DbError::corruption(msg)
    }

    fn record_io_error(&self, e: &DbError) {
        *self.last_error.lock().unwrap() = Some(e.details().to_string());
    }

    fn get_file(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap()
    }

    pub fn check_page_address(&self, page: PageAddress) -> Completion {
        if page == 0 || page >= self.extended_page_count() {
            return Err(self.mark_corrupt(&format!(
                "page address {} out of range (0, {})",
                page,
                self.extended_page_count()
            )));
        }
        Ok(())
    }

    /// Read one page from the volume file. The journal page map takes
    /// precedence over this lazy projection; the buffer pool consults
    /// it first.
    pub fn read_page(&self, page: PageAddress) -> DbResult<Vec<u8>> {
        self.check_open()?;
        self.check_page_address(page)?;

        let mut buf = vec![0u8; self.page_size];
        let result = (|| -> Completion {
            let mut file = self.get_file();
            file.seek(SeekFrom::Start(page * self.page_size as u64))?;
            file.read_exact(&mut buf)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.read_counter.fetch_add(1, Ordering::Relaxed);
                Ok(buf)
            }
            Err(e) => {
                self.record_io_error(&e);
                Err(e)
            }
        }
    }

    /// Write one page image to its home position. Refused on
    /// read-only and append-only volumes.
    pub fn write_page(&self, page: PageAddress, bytes: &[u8]) -> Completion {
        self.check_open()?;
        if self.read_only {
            return Err(DbError::validation(&format!(
                "volume {} is read-only",
                self.name
            )));
        }
        if self.is_append_only() {
            return Err(DbError::validation(&format!(
                "volume {} is in append-only mode",
                self.name
            )));
        }
        self.check_page_address(page)?;
        if bytes.len() != self.page_size {
            return Err(DbError::validation("page image length mismatch"));
        }

        let result = (|| -> Completion {
            let mut file = self.get_file();
            file.seek(SeekFrom::Start(page * self.page_size as u64))?;
            file.write_all(bytes)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.write_counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.record_io_error(&e);
                Err(e)
            }
        }
    }

    /// Claim a page number at the tail of the volume, extending the
    /// file when needed. The garbage chain is consulted by the caller
    /// before falling back to this.
    pub fn allocate_tail_page(&self) -> DbResult<PageAddress> {
        self.check_open()?;
        if self.read_only {
            return Err(DbError::validation(&format!(
                "volume {} is read-only",
                self.name
            )));
        }

        let page = self.next_available_page.fetch_add(1, Ordering::AcqRel);
        let maximum = self.maximum_pages();
        if page >= maximum {
            self.next_available_page.fetch_sub(1, Ordering::AcqRel);
            return Err(DbError::exhausted(&format!(
                "volume {} is full ({} pages)",
                self.name, maximum
            )));
        }
        while page >= self.extended_page_count() {
            self.extend()?;
        }

        let mut head = self.head.wl();
        if page > head.highest_page_used() {
            head.set_highest_page_used(page);
        }
        Ok(page)
    }

    /// Make sure `page` can never be handed out again and lies inside
    /// the file extent. Recovery calls this for every journal-resident
    /// page, because the on-disk head page may predate the allocations
    /// the journal records.
    pub fn reserve_through(&self, page: PageAddress) -> Completion {
        self.check_open()?;
        let mut current = self.next_available_page.load(Ordering::Acquire);
        while current <= page {
            match self.next_available_page.compare_exchange(
                current,
                page + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        while page >= self.extended_page_count() {
            self.extend()?;
        }
        let mut head = self.head.wl();
        if page > head.highest_page_used() {
            head.set_highest_page_used(page);
        }
        Ok(())
    }

    /// Grow the file by one extent: a single zero byte at the new last
    /// offset materializes the length, then metadata is forced.
    fn extend(&self) -> Completion {
        let extension = self.head.rl().extension_pages().max(1);
        let current = self.extended_page_count();
        let maximum = self.maximum_pages();
        if current >= maximum {
            return Err(DbError::exhausted(&format!(
                "volume {} cannot extend past {} pages",
                self.name, maximum
            )));
        }
        let target = (current + extension).min(maximum);

        let result = (|| -> Completion {
            let mut file = self.get_file();
            file.seek(SeekFrom::Start(target * self.page_size as u64 - 1))?;
            file.write_all(&[0u8])?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = result {
            self.record_io_error(&e);
            return Err(e);
        }

        self.extended_page_count.store(target, Ordering::Release);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        {
            let mut head = self.head.wl();
            head.set_page_count(target);
            head.set_last_extension_time(now);
        }
        self.sync_head()?;

        debug!("volume {} extended to {} pages", self.name, target);
        Ok(())
    }

    /// Fold the volatile scalars into the head page and write it out.
    /// Called at checkpoints and after extension.
    pub fn sync_head(&self) -> Completion {
        self.check_open()?;
        if self.read_only || self.is_append_only() {
            return Ok(());
        }

        let bytes = {
            let mut head = self.head.wl();
            head.set_next_available_page(self.next_available_page());
            head.set_page_count(self.extended_page_count());
            head.set_read_counter(self.read_counter());
            head.set_write_counter(self.write_counter());
            head.bytes().to_vec()
        };

        let result = (|| -> Completion {
            let mut file = self.get_file();
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = result {
            self.record_io_error(&e);
            return Err(e);
        }
        Ok(())
    }

    pub fn sync(&self) -> Completion {
        self.check_open()?;
        self.get_file().sync_all()?;
        Ok(())
    }

    /// Clean shutdown: final head sync and file flush. The advisory
    /// lock goes away with the file handle.
    pub fn close(&self) -> Completion {
        if self.is_closed() {
            return Ok(());
        }
        if !self.read_only {
            self.sync_head()?;
        }
        self.sync()?;
        self.closed.store(true, Ordering::Release);
        info!("closed volume {}", self.name);
        Ok(())
    }
}

/// Whole-file advisory lock: shared for read-only, exclusive for
/// read-write.
#[cfg(unix)]
fn lock_volume_file(file: &File, exclusive: bool) -> Completion {
    use std::os::unix::io::AsRawFd;

    let op = if exclusive {
        libc::LOCK_EX | libc::LOCK_NB
    } else {
        libc::LOCK_SH | libc::LOCK_NB
    };
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc != 0 {
        return Err(DbError::io(
            "volume file is locked by another process",
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_volume_file(_file: &File, _exclusive: bool) -> Completion {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeSpec;
    use tempfile::TempDir;

    fn spec(dir: &TempDir, name: &str) -> VolumeSpec {
        VolumeSpec::parse(&format!(
            "{},pageSize:1024,initialPages:4,extensionPages:4,maximumPages:16,create",
            dir.path().join(name).display()
        ))
        .unwrap()
    }

    #[test]
    fn create_write_read_reopen() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, "t.v01");

        let page_bytes = {
            let volume = Volume::open(1, &spec, false).unwrap();
            let page = volume.allocate_tail_page().unwrap();
            assert_eq!(page, 1);

            let mut bytes = vec![0u8; 1024];
            bytes[0] = 1; // Data
            bytes[100] = 0xAB;
            volume.write_page(page, &bytes).unwrap();
            assert_eq!(volume.read_page(page).unwrap(), bytes);
            volume.close().unwrap();
            bytes
        };

        let volume = Volume::open(1, &spec, false).unwrap();
        assert_eq!(volume.next_available_page(), 2);
        assert_eq!(volume.read_page(1).unwrap(), page_bytes);
    }

    #[test]
    fn extension_grows_file() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, "t.v01");
        let volume = Volume::open(1, &spec, false).unwrap();

        for _ in 0..7 {
            volume.allocate_tail_page().unwrap();
        }
        assert!(volume.extended_page_count() >= 8);
        assert!(volume.next_available_page() <= volume.extended_page_count());

        let len = std::fs::metadata(&spec.path).unwrap().len();
        assert_eq!(len, volume.extended_page_count() * 1024);
    }

    #[test]
    fn volume_full_is_exhausted() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, "t.v01");
        let volume = Volume::open(1, &spec, false).unwrap();

        let mut last = Ok(0);
        for _ in 0..20 {
            last = volume.allocate_tail_page();
            if last.is_err() {
                break;
            }
        }
        let err = last.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Exhausted);
    }

    #[test]
    fn out_of_range_page_is_corruption() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, "t.v01");
        let volume = Volume::open(1, &spec, false).unwrap();

        let err = volume.read_page(1000).unwrap_err();
        assert!(err.is_corruption());
        // and the volume is now closed
        assert!(volume.read_page(1).is_err());
    }

    #[test]
    fn append_only_refuses_page_writes() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, "t.v01");
        let volume = Volume::open(1, &spec, false).unwrap();
        let page = volume.allocate_tail_page().unwrap();

        volume.set_append_only(true);
        let err = volume.write_page(page, &vec![0u8; 1024]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);

        volume.set_append_only(false);
        volume.write_page(page, &vec![0u8; 1024]).unwrap();
    }
}
