use std::{
    collections::{HashMap, HashSet},
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info, trace};

use super::{
    page_map::{PageMap, TxMapEntry},
    records::{
        decode_header, encode_record, put_string, JhRecord, PaRecord, RecordHeader, RecordType,
        JE_RECORD_SIZE, MAX_RECORD_SIZE, RECORD_HEADER_SIZE,
    },
};
use crate::{
    error::DbError,
    types::{Completion, DbResult, JournalAddress, PageKey, Timestamp, TreeHandle, VolumeHandle},
    volume::Volume,
};

const PM_CHUNK: usize = 2000;
const TM_CHUNK: usize = 1500;

#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub name: String,
    pub id: u64,
}

#[derive(Debug, Clone)]
pub struct TreeInfo {
    pub volume_handle: VolumeHandle,
    pub name: String,
}

/// The append-only journal: record writer, page map, transaction map
/// and file lifecycle (rollover, base-address advance, reclamation).
///
/// There is one writer at a time; sessions queue behind the engine's
/// journal lock and pay the force latency on commit.
pub struct JournalManager {
    path_prefix: PathBuf,
    block_size: u64,
    read_only: bool,

    current_address: JournalAddress,
    base_address: JournalAddress,
    current_file: Option<File>,
    current_generation: u64,

    page_map: PageMap,
    tx_map: HashMap<Timestamp, TxMapEntry>,

    last_checkpoint_timestamp: Timestamp,
    last_checkpoint_address: JournalAddress,

    volumes: HashMap<VolumeHandle, VolumeInfo>,
    volume_handles: HashMap<String, VolumeHandle>,
    next_volume_handle: VolumeHandle,

    trees: HashMap<TreeHandle, TreeInfo>,
    tree_handles: HashMap<(VolumeHandle, String), TreeHandle>,
    next_tree_handle: TreeHandle,

    identified_volumes: HashSet<VolumeHandle>,
    identified_trees: HashSet<TreeHandle>,

    /// Set while the post-rollover snapshots are written; a snapshot
    /// that does not fit the block is an error, never a re-rollover.
    writing_snapshot: bool,
}

impl JournalManager {
    pub fn new(path_prefix: PathBuf, block_size: u64, read_only: bool) -> JournalManager {
        JournalManager {
            path_prefix,
            block_size,
            read_only,
            current_address: 0,
            base_address: 0,
            current_file: None,
            current_generation: 0,
            page_map: PageMap::new(),
            tx_map: HashMap::new(),
            last_checkpoint_timestamp: 0,
            last_checkpoint_address: 0,
            volumes: HashMap::new(),
            volume_handles: HashMap::new(),
            next_volume_handle: 1,
            trees: HashMap::new(),
            tree_handles: HashMap::new(),
            next_tree_handle: 1,
            identified_volumes: HashSet::new(),
            identified_trees: HashSet::new(),
            writing_snapshot: false,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn current_address(&self) -> JournalAddress {
        self.current_address
    }

    pub fn base_address(&self) -> JournalAddress {
        self.base_address
    }

    pub fn last_checkpoint_timestamp(&self) -> Timestamp {
        self.last_checkpoint_timestamp
    }

    pub fn generation_of(&self, address: JournalAddress) -> u64 {
        address / self.block_size
    }

    pub fn file_path(&self, generation: u64) -> PathBuf {
        let name = format!(
            "{}.{:016}",
            self.path_prefix
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "journal".to_string()),
            generation
        );
        match self.path_prefix.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }

    // ------------------------------------------------------------------
    // recovery seeding

    /// Install the state the recovery plan reconstructed. The block
    /// size recorded in the keystone header wins over the configured
    /// one: journal addresses factor into (generation, offset) through
    /// it, so it must stay what it was when the files were written.
    #[allow(clippy::too_many_arguments)]
    pub fn seed_from_recovery(
        &mut self,
        block_size: u64,
        base_address: JournalAddress,
        page_map: PageMap,
        tx_map: HashMap<Timestamp, TxMapEntry>,
        volumes: HashMap<VolumeHandle, VolumeInfo>,
        trees: HashMap<TreeHandle, TreeInfo>,
        last_checkpoint_timestamp: Timestamp,
        next_generation: u64,
    ) {
        if block_size != self.block_size {
            log::warn!(
                "journal block size {} on disk overrides configured {}",
                block_size,
                self.block_size
            );
            self.block_size = block_size;
        }
        self.base_address = base_address;
        self.page_map = page_map;
        self.tx_map = tx_map;

        self.next_volume_handle = volumes.keys().max().map(|h| h + 1).unwrap_or(1);
        self.next_tree_handle = trees.keys().max().map(|h| h + 1).unwrap_or(1);
        self.volume_handles = volumes
            .iter()
            .map(|(h, info)| (info.name.clone(), *h))
            .collect();
        self.tree_handles = trees
            .iter()
            .map(|(h, info)| ((info.volume_handle, info.name.clone()), *h))
            .collect();
        self.volumes = volumes;
        self.trees = trees;
        self.last_checkpoint_timestamp = last_checkpoint_timestamp;
        self.current_generation = next_generation.max(1);
    }

    /// Open a fresh journal file and write its header and snapshots.
    /// Called once at startup (after the recovery plan) and by every
    /// rollover.
    pub fn start_new_generation(&mut self) -> Completion {
        if self.read_only {
            return Ok(());
        }
        if self.current_generation == 0 {
            self.current_generation = 1;
        }

        if let Some(parent) = self.file_path(self.current_generation).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path = self.file_path(self.current_generation);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        self.current_file = Some(file);
        self.current_address = self.current_generation * self.block_size;
        self.identified_volumes.clear();
        self.identified_trees.clear();

        if self.base_address == 0 {
            self.base_address = self.current_address;
        }

        info!(
            "journal generation {} started at {}",
            self.current_generation,
            path.display()
        );

        // JH first, then the identity records and the map snapshots so
        // that recovery never needs to rescan previous files for them
        self.writing_snapshot = true;
        let result = (|| -> Completion {
            let jh = JhRecord {
                block_size: self.block_size,
                base_address: self.base_address,
                current_address: self.current_address,
            };
            self.append(RecordType::JH, 0, &jh.encode())?;

            let volumes: Vec<(VolumeHandle, VolumeInfo)> = self
                .volumes
                .iter()
                .map(|(h, i)| (*h, i.clone()))
                .collect();
            for (handle, info) in volumes {
                self.append_iv(handle, &info)?;
            }
            let trees: Vec<(TreeHandle, TreeInfo)> =
                self.trees.iter().map(|(h, i)| (*h, i.clone())).collect();
            for (handle, info) in trees {
                self.append_it(handle, &info)?;
            }

            self.write_page_map_snapshot()?;
            self.write_tx_map_snapshot()?;
            Ok(())
        })();
        self.writing_snapshot = false;
        result
    }

    // ------------------------------------------------------------------
    // append path

    fn append(
        &mut self,
        rtype: RecordType,
        timestamp: Timestamp,
        payload: &[u8],
    ) -> DbResult<JournalAddress> {
        if self.read_only {
            return Err(DbError::validation("journal is read-only"));
        }
        if self.current_file.is_none() {
            return Err(DbError::corruption("journal has no current file"));
        }

        let record = encode_record(rtype, timestamp, payload);
        let offset = self.current_address % self.block_size;

        // keep room for the trailing JE of this file
        if rtype != RecordType::JE
            && offset + (record.len() + JE_RECORD_SIZE) as u64 > self.block_size
        {
            if self.writing_snapshot {
                return Err(DbError::exhausted(
                    "journal block size cannot hold the rollover snapshots",
                ));
            }
            self.rollover()?;
            return self.append(rtype, timestamp, payload);
        }

        let address = self.current_address;
        let offset = address % self.block_size;
        {
            let file = self.current_file.as_mut().unwrap();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&record)?;
        }
        self.current_address += record.len() as u64;

        trace!(
            "journal append {} at {} ({} bytes)",
            rtype.name(),
            address,
            record.len()
        );
        Ok(address)
    }

    /// Journal file rollover: close the full file with a `JE`, open the
    /// next generation with `JH` + `PM`/`TM` snapshots.
    fn rollover(&mut self) -> Completion {
        self.write_end_record()?;
        self.force()?;
        self.current_generation += 1;
        debug!("journal rollover to generation {}", self.current_generation);
        self.start_new_generation()
    }

    fn write_end_record(&mut self) -> Completion {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&self.current_address.to_be_bytes());
        payload.extend_from_slice(&self.base_address.to_be_bytes());
        self.append(RecordType::JE, 0, &payload)?;
        Ok(())
    }

    /// Clean-shutdown marker.
    pub fn close(&mut self) -> Completion {
        if self.read_only || self.current_file.is_none() {
            return Ok(());
        }
        self.write_end_record()?;
        self.force()?;
        Ok(())
    }

    pub fn force(&mut self) -> Completion {
        if let Some(file) = self.current_file.as_mut() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn write_page_map_snapshot(&mut self) -> Completion {
        let entries = self.page_map.entries();
        for chunk in entries.chunks(PM_CHUNK) {
            let mut payload = Vec::with_capacity(4 + chunk.len() * 28);
            payload.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
            for (key, node) in chunk {
                payload.extend_from_slice(&key.volume.to_be_bytes());
                payload.extend_from_slice(&key.page.to_be_bytes());
                payload.extend_from_slice(&node.timestamp.to_be_bytes());
                payload.extend_from_slice(&node.address.to_be_bytes());
            }
            self.append(RecordType::PM, 0, &payload)?;
        }
        Ok(())
    }

    fn write_tx_map_snapshot(&mut self) -> Completion {
        let entries: Vec<TxMapEntry> = self.tx_map.values().copied().collect();
        for chunk in entries.chunks(TM_CHUNK) {
            let mut payload = Vec::with_capacity(4 + chunk.len() * 32);
            payload.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
            for e in chunk {
                payload.extend_from_slice(&e.start_timestamp.to_be_bytes());
                payload.extend_from_slice(&e.commit_timestamp.to_be_bytes());
                payload.extend_from_slice(&e.start_address.to_be_bytes());
                payload.extend_from_slice(&e.last_address.to_be_bytes());
            }
            self.append(RecordType::TM, 0, &payload)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // identity records

    /// Assign (or look up) a volume handle by name without writing an
    /// identity record; the engine reserves the handle before it can
    /// construct the volume object.
    pub fn reserve_volume_handle(&mut self, name: &str) -> VolumeHandle {
        if let Some(h) = self.volume_handles.get(name) {
            return *h;
        }
        let h = self.next_volume_handle;
        self.next_volume_handle += 1;
        self.volume_handles.insert(name.to_string(), h);
        self.volumes.insert(
            h,
            VolumeInfo {
                name: name.to_string(),
                id: 0,
            },
        );
        h
    }

    /// Bind the volume's handle, writing an `IV` record the first time
    /// the volume appears in the current generation.
    pub fn identify_volume(&mut self, volume: &Volume) -> DbResult<VolumeHandle> {
        let handle = self.reserve_volume_handle(volume.name());
        if let Some(info) = self.volumes.get_mut(&handle) {
            if info.id == 0 {
                info.id = volume.id();
            }
        }

        if !self.read_only && !self.identified_volumes.contains(&handle) {
            let info = self.volumes.get(&handle).cloned().unwrap();
            self.append_iv(handle, &info)?;
        }
        Ok(handle)
    }

    fn append_iv(&mut self, handle: VolumeHandle, info: &VolumeInfo) -> Completion {
        let mut payload = Vec::new();
        payload.extend_from_slice(&handle.to_be_bytes());
        payload.extend_from_slice(&info.id.to_be_bytes());
        put_string(&mut payload, &info.name);
        self.append(RecordType::IV, 0, &payload)?;
        self.identified_volumes.insert(handle);
        Ok(())
    }

    /// Bind (or look up) a tree's handle; `IT` once per generation.
    pub fn identify_tree(&mut self, volume_handle: VolumeHandle, name: &str) -> DbResult<TreeHandle> {
        let key = (volume_handle, name.to_string());
        let handle = match self.tree_handles.get(&key) {
            Some(h) => *h,
            None => {
                let h = self.next_tree_handle;
                self.next_tree_handle += 1;
                self.tree_handles.insert(key, h);
                self.trees.insert(
                    h,
                    TreeInfo {
                        volume_handle,
                        name: name.to_string(),
                    },
                );
                h
            }
        };

        if !self.read_only && !self.identified_trees.contains(&handle) {
            let info = self.trees.get(&handle).cloned().unwrap();
            self.append_it(handle, &info)?;
        }
        Ok(handle)
    }

    fn append_it(&mut self, handle: TreeHandle, info: &TreeInfo) -> Completion {
        let mut payload = Vec::new();
        payload.extend_from_slice(&handle.to_be_bytes());
        payload.extend_from_slice(&info.volume_handle.to_be_bytes());
        put_string(&mut payload, &info.name);
        self.append(RecordType::IT, 0, &payload)?;
        self.identified_trees.insert(handle);
        Ok(())
    }

    pub fn tree_info(&self, handle: TreeHandle) -> Option<&TreeInfo> {
        self.trees.get(&handle)
    }

    pub fn volume_info(&self, handle: VolumeHandle) -> Option<&VolumeInfo> {
        self.volumes.get(&handle)
    }

    pub fn volume_handle_by_name(&self, name: &str) -> Option<VolumeHandle> {
        self.volume_handles.get(name).copied()
    }

    // ------------------------------------------------------------------
    // pages

    /// Append a page image and make it the page's newest map entry.
    /// Dirty frames go through here; volume files see the page later,
    /// when the copier gets to it.
    pub fn write_page(
        &mut self,
        key: PageKey,
        timestamp: Timestamp,
        bytes: &[u8],
    ) -> DbResult<JournalAddress> {
        if !self.volumes.contains_key(&key.volume) {
            return Err(DbError::corruption(&format!(
                "page write for unidentified volume handle {}",
                key.volume
            )));
        }

        let pa = PaRecord {
            volume_handle: key.volume,
            page_address: key.page,
            bytes,
        };
        let address = self.append(RecordType::PA, timestamp, &pa.encode())?;
        self.page_map.put(key, timestamp, address);
        Ok(address)
    }

    pub fn lookup_page(&self, key: PageKey) -> Option<JournalAddress> {
        self.page_map.lookup(&key)
    }

    pub fn page_map(&self) -> &PageMap {
        &self.page_map
    }

    /// Read a record at an arbitrary journal address, possibly in an
    /// older generation.
    pub fn read_record(&self, address: JournalAddress) -> DbResult<(RecordHeader, Vec<u8>)> {
        let generation = self.generation_of(address);
        let offset = address % self.block_size;
        let path = self.file_path(generation);

        let mut file = File::open(&path).map_err(|_| {
            DbError::corruption(&format!(
                "journal file {} is missing",
                path.display()
            ))
        })?;

        let mut head = [0u8; RECORD_HEADER_SIZE];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut head)
            .map_err(|_| DbError::corruption("journal record truncated"))?;
        let header = decode_header(&head)?;

        let mut payload = vec![0u8; header.length - RECORD_HEADER_SIZE];
        file.read_exact(&mut payload)
            .map_err(|_| DbError::corruption("journal record truncated"))?;
        Ok((header, payload))
    }

    /// Fetch the page image stored by the `PA` record at `address`.
    pub fn read_page_image(&self, address: JournalAddress, page_size: usize) -> DbResult<Vec<u8>> {
        let (header, payload) = self.read_record(address)?;
        if header.rtype != RecordType::PA {
            return Err(DbError::corruption(&format!(
                "expected PA at journal address {}, found {}",
                address,
                header.rtype.name()
            )));
        }
        let pa = PaRecord::decode(&payload)?;
        if pa.bytes.len() != page_size {
            return Err(DbError::corruption(&format!(
                "page image at {} has {} bytes, expected {}",
                address,
                pa.bytes.len(),
                page_size
            )));
        }
        Ok(pa.bytes.to_vec())
    }

    // ------------------------------------------------------------------
    // transactions

    /// Write a committed transaction envelope. Oversized envelopes are
    /// chained: every chunk but the last carries timestamp 0 and is
    /// linked through the backchain address; only the durable final
    /// chunk (timestamp = commit) makes the transaction committed.
    pub fn write_transaction(
        &mut self,
        start_timestamp: Timestamp,
        commit_timestamp: Timestamp,
        inner: &[u8],
    ) -> DbResult<JournalAddress> {
        let chunk_capacity = MAX_RECORD_SIZE - RECORD_HEADER_SIZE - 16;
        let mut chunks: Vec<&[u8]> = inner.chunks(chunk_capacity).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        let mut first_address = 0;
        let mut previous = 0u64;
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut payload = Vec::with_capacity(16 + chunk.len());
            payload.extend_from_slice(&previous.to_be_bytes());
            payload.extend_from_slice(&start_timestamp.to_be_bytes());
            payload.extend_from_slice(chunk);

            let ts = if i + 1 == count { commit_timestamp } else { 0 };
            let address = self.append(RecordType::TX, ts, &payload)?;
            if i == 0 {
                first_address = address;
            }
            previous = address;
        }

        self.tx_map.insert(
            start_timestamp,
            TxMapEntry {
                start_timestamp,
                commit_timestamp,
                start_address: first_address,
                last_address: previous,
            },
        );
        Ok(previous)
    }

    /// Reassemble a chained envelope by walking the backchain from its
    /// last record.
    pub fn assemble_transaction(&self, last_address: JournalAddress) -> DbResult<Vec<u8>> {
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut address = last_address;
        while address != 0 {
            let (header, payload) = self.read_record(address)?;
            if header.rtype != RecordType::TX {
                return Err(DbError::corruption(&format!(
                    "backchain led to {} at {}",
                    header.rtype.name(),
                    address
                )));
            }
            if payload.len() < 16 {
                return Err(DbError::corruption("TX record too short"));
            }
            let backchain = u64::from_be_bytes(payload[0..8].try_into().unwrap());
            chunks.push(payload[16..].to_vec());
            address = backchain;
        }

        chunks.reverse();
        Ok(chunks.concat())
    }

    pub fn tx_map(&self) -> &HashMap<Timestamp, TxMapEntry> {
        &self.tx_map
    }

    // ------------------------------------------------------------------
    // checkpoint and reclamation

    /// Record that every page update with a timestamp at or below
    /// `timestamp` is durably journaled, then prune the transaction
    /// map. The caller (the engine) flushes dirty frames first.
    pub fn checkpoint(&mut self, timestamp: Timestamp) -> Completion {
        let system_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.recompute_base_address();

        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&self.base_address.to_be_bytes());
        payload.extend_from_slice(&system_time.to_be_bytes());
        let address = self.append(RecordType::CP, timestamp, &payload)?;
        self.force()?;

        self.last_checkpoint_timestamp = timestamp;
        self.last_checkpoint_address = address;
        self.tx_map
            .retain(|_, e| !(e.is_committed() && e.commit_timestamp <= timestamp));

        info!(
            "checkpoint at timestamp {}, base address {}",
            timestamp, self.base_address
        );
        Ok(())
    }

    fn recompute_base_address(&mut self) {
        let mut base = self.current_address;
        if let Some(addr) = self.page_map.min_address() {
            base = base.min(addr);
        }
        for e in self.tx_map.values() {
            if e.start_address != 0 {
                base = base.min(e.start_address);
            }
        }
        if self.last_checkpoint_address != 0 {
            base = base.min(self.last_checkpoint_address);
        }
        // never regress
        self.base_address = self.base_address.max(base.min(self.current_address));
    }

    /// One copier pass: write the oldest checkpointed page images back
    /// to their home volume positions, prune the map, advance the base
    /// address, and drop journal files that fell behind it.
    ///
    /// Returns the number of pages copied.
    pub fn copier_pass(
        &mut self,
        max_pages: usize,
        resolve: &dyn Fn(VolumeHandle) -> Option<std::sync::Arc<Volume>>,
    ) -> DbResult<usize> {
        if self.read_only {
            return Ok(0);
        }
        let limit = self.last_checkpoint_timestamp;
        if limit == 0 {
            return Ok(0);
        }

        // oldest first, so the base address advances as fast as
        // possible
        let mut candidates: Vec<(JournalAddress, PageKey)> = Vec::new();
        for key in self.page_map.keys() {
            if let Some(node) = self.page_map.lookup_at(&key, limit) {
                candidates.push((node.address, key));
            }
        }
        candidates.sort();
        candidates.truncate(max_pages);

        let mut copied = 0;
        for (address, key) in candidates {
            let volume = match resolve(key.volume) {
                Some(v) => v,
                None => continue,
            };
            if volume.is_append_only() || volume.is_read_only() || volume.is_closed() {
                continue;
            }

            let bytes = self.read_page_image(address, volume.page_size())?;
            volume.write_page(key.page, &bytes)?;
            self.page_map.prune_through(&key, address);
            copied += 1;
        }

        if copied > 0 {
            self.recompute_base_address();
            self.reclaim_files()?;
        }
        Ok(copied)
    }

    /// Delete journal files wholly behind the base address. Removing
    /// any file *between* the base address and the newest generation
    /// corrupts the installation; those are never touched.
    fn reclaim_files(&mut self) -> Completion {
        let base_generation = self.generation_of(self.base_address);
        for generation in 1..base_generation {
            let path = self.file_path(generation);
            if path.exists() {
                std::fs::remove_file(&path)?;
                debug!("reclaimed journal file {}", path.display());
            }
        }
        Ok(())
    }

    /// Journal generations currently on disk, oldest first.
    pub fn list_generations(&self) -> Vec<u64> {
        let prefix = self
            .path_prefix
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "journal".to_string());
        let dir = self
            .path_prefix
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut generations = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(rest) = name.strip_prefix(&format!("{}.", prefix)) {
                    if rest.len() == 16 {
                        if let Ok(generation) = rest.parse::<u64>() {
                            generations.push(generation);
                        }
                    }
                }
            }
        }
        generations.sort_unstable();
        generations
    }
}
