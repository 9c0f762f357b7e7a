use std::{
    collections::HashMap,
    convert::TryInto,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use itertools::Itertools;
use log::{debug, info, warn};

use super::{
    manager::{TreeInfo, VolumeInfo},
    page_map::{PageMap, TxMapEntry},
    records::{
        decode_header, InnerRecord, JhRecord, PaRecord, RecordReader, RecordType, SR_LONG_RECORD,
        RECORD_HEADER_SIZE,
    },
};
use crate::{
    database::Database,
    error::DbError,
    key::Key,
    tree::{Session, Tree},
    types::{Completion, DbResult, JournalAddress, PageKey, Pod, Timestamp, TreeHandle, VolumeHandle},
};

/// Everything phase 1 reconstructs: handle maps, page/branch maps,
/// transaction map, the keystone checkpoint and the failure boundary.
pub struct RecoveryPlan {
    pub keystone_generation: u64,
    pub block_size: u64,
    pub base_address: JournalAddress,
    /// End of the valid record stream; everything past it is the
    /// aborted suffix of the crash.
    pub boundary: JournalAddress,
    pub page_map: PageMap,
    /// Page images past the checkpoint that fell behind the failure
    /// boundary; kept only so long values referenced by uncommitted
    /// transactions stay reconstructible.
    pub branch_map: PageMap,
    pub tx_map: HashMap<Timestamp, TxMapEntry>,
    pub volumes: HashMap<VolumeHandle, VolumeInfo>,
    pub trees: HashMap<TreeHandle, TreeInfo>,
    pub checkpoint_timestamp: Timestamp,
    pub checkpoint_address: JournalAddress,
    pub max_timestamp: Timestamp,
    pub clean_shutdown: bool,
}

impl RecoveryPlan {
    pub fn committed_count(&self) -> usize {
        self.tx_map
            .values()
            .filter(|e| e.is_committed() && e.commit_timestamp > self.checkpoint_timestamp)
            .count()
    }
}

fn file_path(prefix: &Path, generation: u64) -> PathBuf {
    let name = format!(
        "{}.{:016}",
        prefix
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "journal".to_string()),
        generation
    );
    match prefix.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

fn list_generations(prefix: &Path) -> Vec<u64> {
    let name = prefix
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "journal".to_string());
    let dir = prefix
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut generations = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let file = entry.file_name().to_string_lossy().to_string();
            if let Some(rest) = file.strip_prefix(&format!("{}.", name)) {
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

/// Phase 1: locate the keystone (the newest journal file whose header
/// validates and that contains a checkpoint), scan it into the plan,
/// then verify every predecessor file down to the base address.
pub fn plan(prefix: &Path, default_block_size: u64) -> DbResult<Option<RecoveryPlan>> {
    let generations = list_generations(prefix);
    if generations.is_empty() {
        return Ok(None);
    }

    let mut saw_substance = false;
    for generation in generations.iter().rev() {
        match scan_file(prefix, *generation, default_block_size)? {
            Scan::Keystone(plan) => {
                validate_predecessors(prefix, &plan)?;
                return Ok(Some(plan));
            }
            Scan::NotKeystone { substantial } => {
                saw_substance |= substantial;
                debug!(
                    "journal generation {} holds no checkpoint; stepping back",
                    generation
                );
            }
        }
    }

    if saw_substance {
        return Err(DbError::corruption(
            "no journal file contains a valid checkpoint",
        ));
    }
    // nothing but empty headers: treat as a fresh installation
    warn!("journal files exist but carry no state; starting fresh");
    Ok(None)
}

enum Scan {
    Keystone(RecoveryPlan),
    NotKeystone { substantial: bool },
}

fn scan_file(prefix: &Path, generation: u64, default_block_size: u64) -> DbResult<Scan> {
    let path = file_path(prefix, generation);
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(_) => return Ok(Scan::NotKeystone { substantial: false }),
    };
    let file_len = file.metadata()?.len();

    // the journal header is the first record of every file
    let first = match read_record_at(&mut file, 0, file_len) {
        Ok(Some((header, payload))) if header.rtype == RecordType::JH => {
            match JhRecord::decode(&payload) {
                Ok(jh) => jh,
                Err(_) => return Ok(Scan::NotKeystone { substantial: true }),
            }
        }
        _ => return Ok(Scan::NotKeystone { substantial: true }),
    };

    let block_size = if first.block_size > 0 {
        first.block_size
    } else {
        default_block_size
    };
    let file_base = generation * block_size;
    let mut base_address = first.base_address;

    let mut offset = {
        // re-read to learn the JH length
        let (header, _) = read_record_at(&mut file, 0, file_len)?.unwrap();
        header.length as u64
    };

    let mut volumes: HashMap<VolumeHandle, VolumeInfo> = HashMap::new();
    let mut trees: HashMap<TreeHandle, TreeInfo> = HashMap::new();
    let mut tx_map: HashMap<Timestamp, TxMapEntry> = HashMap::new();
    let mut pm_entries: Vec<(PageKey, Timestamp, JournalAddress)> = Vec::new();
    let mut pa_entries: Vec<(PageKey, Timestamp, JournalAddress)> = Vec::new();
    let mut checkpoint_timestamp = 0;
    let mut checkpoint_address = 0;
    let mut max_timestamp = 0;
    let mut clean_shutdown = false;
    let mut substantial = false;

    loop {
        if offset >= file_len {
            break;
        }
        let address = file_base + offset;
        let record = match read_record_at(&mut file, offset, file_len) {
            Ok(Some(r)) => r,
            // a torn or malformed record ends the valid stream
            Ok(None) | Err(_) => {
                debug!(
                    "journal scan of generation {} stops at offset {}",
                    generation, offset
                );
                break;
            }
        };
        let (header, payload) = record;
        max_timestamp = max_timestamp.max(header.timestamp);

        // a record whose payload does not parse ends the valid stream
        // exactly like a torn frame does
        let outcome = (|| -> DbResult<bool> {
            match header.rtype {
                RecordType::JH => return Ok(false), // a header mid-file is garbage
                RecordType::JE => {
                    clean_shutdown = true;
                    return Ok(false);
                }
                RecordType::CP => {
                    let mut r = RecordReader::new(&payload);
                    let base = r.u64()?;
                    let _system_time = r.u64()?;
                    if base > 0 {
                        base_address = base;
                    }
                    checkpoint_timestamp = header.timestamp;
                    checkpoint_address = address;
                }
                RecordType::IV => {
                    let mut r = RecordReader::new(&payload);
                    let handle = r.u32()?;
                    let id = r.u64()?;
                    let name = r.string()?;
                    volumes.insert(handle, VolumeInfo { name, id });
                }
                RecordType::IT => {
                    let mut r = RecordReader::new(&payload);
                    let handle = r.u32()?;
                    let volume_handle = r.u32()?;
                    let name = r.string()?;
                    trees.insert(
                        handle,
                        TreeInfo {
                            volume_handle,
                            name,
                        },
                    );
                }
                RecordType::PA => {
                    let pa = PaRecord::decode(&payload)?;
                    pa_entries.push((
                        PageKey::new(pa.volume_handle, pa.page_address),
                        header.timestamp,
                        address,
                    ));
                    substantial = true;
                }
                RecordType::PM => {
                    let mut r = RecordReader::new(&payload);
                    let count = r.u32()?;
                    for _ in 0..count {
                        let volume = r.u32()?;
                        let page = r.u64()?;
                        let ts = r.u64()?;
                        let addr = r.u64()?;
                        pm_entries.push((PageKey::new(volume, page), ts, addr));
                    }
                }
                RecordType::TM => {
                    let mut r = RecordReader::new(&payload);
                    let count = r.u32()?;
                    for _ in 0..count {
                        let entry = TxMapEntry {
                            start_timestamp: r.u64()?,
                            commit_timestamp: r.u64()?,
                            start_address: r.u64()?,
                            last_address: r.u64()?,
                        };
                        max_timestamp = max_timestamp.max(entry.commit_timestamp);
                        tx_map.insert(entry.start_timestamp, entry);
                    }
                }
                RecordType::TX => {
                    if payload.len() < 16 {
                        return Ok(false);
                    }
                    let backchain = u64::from_be_bytes(payload[0..8].try_into().unwrap());
                    let start_timestamp = u64::from_be_bytes(payload[8..16].try_into().unwrap());
                    substantial = true;
                    if header.timestamp != 0 {
                        // the durable final chunk commits the envelope
                        tx_map.insert(
                            start_timestamp,
                            TxMapEntry {
                                start_timestamp,
                                commit_timestamp: header.timestamp,
                                start_address: if backchain == 0 { address } else { backchain },
                                last_address: address,
                            },
                        );
                    }
                }
                // inner record types never stand alone in the stream
                RecordType::SR | RecordType::DR | RecordType::DT | RecordType::CU => {
                    return Ok(false)
                }
            }
            Ok(true)
        })();

        match outcome {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                debug!(
                    "journal scan of generation {} stops on a bad record at offset {}: {}",
                    generation, offset, e
                );
                break;
            }
        }

        offset += header.length as u64;
    }

    if checkpoint_address == 0 {
        return Ok(Scan::NotKeystone { substantial });
    }

    let boundary = file_base + offset;

    // the page map is rebuilt oldest-first so each put leaves the
    // newest image at the head; post-checkpoint snapshot entries whose
    // address fell past the boundary go to the branch map
    let mut page_map = PageMap::new();
    let mut branch_map = PageMap::new();
    pm_entries.sort_by_key(|(key, ts, _)| (*key, *ts));
    for (key, ts, addr) in pm_entries {
        if ts > checkpoint_timestamp && addr > boundary {
            branch_map.put(key, ts, addr);
        } else {
            page_map.put(key, ts, addr);
        }
    }
    for (key, ts, addr) in pa_entries {
        page_map.put(key, ts, addr);
    }

    if base_address == 0 {
        base_address = file_base;
    }

    info!(
        "keystone generation {}: checkpoint ts {}, boundary {}, clean={}",
        generation, checkpoint_timestamp, boundary, clean_shutdown
    );

    Ok(Scan::Keystone(RecoveryPlan {
        keystone_generation: generation,
        block_size,
        base_address,
        boundary,
        page_map,
        branch_map,
        tx_map,
        volumes,
        trees,
        checkpoint_timestamp,
        checkpoint_address,
        max_timestamp,
        clean_shutdown,
    }))
}

fn read_record_at(
    file: &mut File,
    offset: u64,
    file_len: u64,
) -> DbResult<Option<(super::records::RecordHeader, Vec<u8>)>> {
    if offset + RECORD_HEADER_SIZE as u64 > file_len {
        return Ok(None);
    }
    let mut head = [0u8; RECORD_HEADER_SIZE];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut head)?;

    let header = match decode_header(&head) {
        Ok(h) => h,
        Err(_) => return Ok(None),
    };
    if offset + header.length as u64 > file_len {
        return Ok(None);
    }

    let mut payload = vec![0u8; header.length - RECORD_HEADER_SIZE];
    file.read_exact(&mut payload)?;
    Ok(Some((header, payload)))
}

/// Every predecessor file from the base address up to the keystone
/// must be present with a valid header, and the newest page image it
/// holds must be readable. A missing interior file is a recovery
/// failure.
fn validate_predecessors(prefix: &Path, plan: &RecoveryPlan) -> Completion {
    let base_generation = plan.base_address / plan.block_size;

    for generation in base_generation..plan.keystone_generation {
        let path = file_path(prefix, generation);
        let mut file = File::open(&path).map_err(|_| {
            DbError::corruption(&format!(
                "journal file {} is missing between the base address and the keystone",
                path.display()
            ))
        })?;
        let file_len = file.metadata()?.len();
        match read_record_at(&mut file, 0, file_len)? {
            Some((header, payload)) if header.rtype == RecordType::JH => {
                JhRecord::decode(&payload)?;
            }
            _ => {
                return Err(DbError::corruption(&format!(
                    "journal file {} has no valid header",
                    path.display()
                )))
            }
        }

        // the last-required page image of this generation must read
        let last_pa = plan
            .page_map
            .entries()
            .into_iter()
            .filter(|(_, node)| node.address / plan.block_size == generation)
            .map(|(_, node)| node.address)
            .max();
        if let Some(address) = last_pa {
            let offset = address % plan.block_size;
            match read_record_at(&mut file, offset, file_len)? {
                Some((header, _)) if header.rtype == RecordType::PA => {}
                _ => {
                    return Err(DbError::corruption(&format!(
                        "page image at journal address {} is unreadable",
                        address
                    )))
                }
            }
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// phase 2: apply

/// Receives the replayed operations. The default performs ordinary
/// store/remove/remove-tree calls with transactions disabled; MVCC
/// variants can override `rollback` to prune uncommitted versions.
pub trait RecoveryListener {
    fn store(
        &self,
        tree: &Pod<Tree>,
        session: &mut Session,
        key: &Key,
        value: &[u8],
        long: bool,
    ) -> Completion;

    fn remove_range(
        &self,
        tree: &Pod<Tree>,
        session: &mut Session,
        low: &Key,
        high: &Key,
    ) -> Completion;

    fn remove_tree(&self, handle: TreeHandle, session: &mut Session) -> Completion;

    fn cache_update(&self, _tree: TreeHandle, _payload: &[u8]) -> Completion {
        Ok(())
    }

    fn rollback(&self, _start_timestamp: Timestamp) -> Completion {
        Ok(())
    }
}

pub struct DefaultRecoveryListener;

impl RecoveryListener for DefaultRecoveryListener {
    fn store(
        &self,
        tree: &Pod<Tree>,
        session: &mut Session,
        key: &Key,
        value: &[u8],
        long: bool,
    ) -> Completion {
        let flags = if long {
            crate::page::page::TB_LONG_RECORD
        } else {
            0
        };
        crate::tree::store::store_raw(tree, session, key, value, flags)
    }

    fn remove_range(
        &self,
        tree: &Pod<Tree>,
        session: &mut Session,
        low: &Key,
        high: &Key,
    ) -> Completion {
        crate::tree::remove::remove_key_range(tree, session, low, high)?;
        Ok(())
    }

    fn remove_tree(&self, handle: TreeHandle, session: &mut Session) -> Completion {
        Database::remove_tree_by_handle(handle, session)
    }
}

/// Phase 2: committed transactions in commit-timestamp order, each
/// envelope reassembled through its backchain and replayed; live and
/// aborted transactions go to the rollback listener in start order.
pub fn apply(plan: &RecoveryPlan, listener: &dyn RecoveryListener) -> Completion {
    let mut session = Database::new_session();
    let result = apply_with_session(plan, listener, &mut session);
    Database::release_session(&mut session);
    result
}

fn apply_with_session(
    plan: &RecoveryPlan,
    listener: &dyn RecoveryListener,
    session: &mut Session,
) -> Completion {
    let committed: Vec<TxMapEntry> = plan
        .tx_map
        .values()
        .filter(|e| e.is_committed() && e.commit_timestamp > plan.checkpoint_timestamp)
        .copied()
        .sorted_by_key(|e| e.commit_timestamp)
        .collect();

    for entry in committed {
        let envelope = Database::journal().assemble_transaction(entry.last_address)?;
        let records = InnerRecord::parse_stream(&envelope)?;
        debug!(
            "replaying transaction started at {} ({} inner records)",
            entry.start_timestamp,
            records.len()
        );

        for record in records {
            match record {
                InnerRecord::Store {
                    tree,
                    flags,
                    key,
                    value,
                    ..
                } => {
                    let tree = Database::tree_by_handle(tree)?;
                    listener.store(
                        &tree,
                        session,
                        &Key::from_encoded(&key),
                        &value,
                        flags & SR_LONG_RECORD != 0,
                    )?;
                }
                InnerRecord::DeleteRange {
                    tree, low, high, ..
                } => {
                    let tree = Database::tree_by_handle(tree)?;
                    listener.remove_range(
                        &tree,
                        session,
                        &Key::from_encoded(&low),
                        &Key::from_encoded(&high),
                    )?;
                }
                InnerRecord::DeleteTree { tree, .. } => {
                    listener.remove_tree(tree, session)?;
                }
                InnerRecord::CacheUpdate { tree, payload, .. } => {
                    listener.cache_update(tree, &payload)?;
                }
            }
        }
    }

    let unfinished: Vec<Timestamp> = plan
        .tx_map
        .values()
        .filter(|e| !e.is_committed())
        .map(|e| e.start_timestamp)
        .sorted()
        .collect();
    for start in unfinished {
        listener.rollback(start)?;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// journal scan (CLI)

/// Render one journal file record by record, in the engine's log-dump
/// style.
pub fn scan_to_string(prefix: &Path, generation: u64) -> DbResult<String> {
    let path = file_path(prefix, generation);
    let mut file = File::open(&path)
        .map_err(|_| DbError::validation(&format!("no journal file {}", path.display())))?;
    let file_len = file.metadata()?.len();

    let mut depiction = format!("{}\n", path.display());
    let mut offset = 0u64;
    let mut record_id = 0;

    while offset < file_len {
        let (header, payload) = match read_record_at(&mut file, offset, file_len)? {
            Some(r) => r,
            None => {
                depiction.push_str(&format!("├── [torn record at offset {}]\n", offset));
                break;
            }
        };

        depiction.push_str(&format!(
            "├── {}-[pos {}]-[record {}] ts {}\n",
            header.rtype.name(),
            offset,
            record_id,
            header.timestamp,
        ));

        match header.rtype {
            RecordType::JH => {
                if let Ok(jh) = JhRecord::decode(&payload) {
                    depiction.push_str(&format!(
                        "│   ├── block size {}\n│   ├── base address {}\n│   └── current address {}\n",
                        jh.block_size, jh.base_address, jh.current_address,
                    ));
                }
            }
            RecordType::PA => {
                if let Ok(pa) = PaRecord::decode(&payload) {
                    depiction.push_str(&format!(
                        "│   └── volume {} page {} ({} bytes, head {})\n",
                        pa.volume_handle,
                        pa.page_address,
                        pa.bytes.len(),
                        hex::encode(&pa.bytes[..pa.bytes.len().min(8)]),
                    ));
                }
            }
            RecordType::TX => {
                if payload.len() >= 16 {
                    let backchain = u64::from_be_bytes(payload[0..8].try_into().unwrap());
                    let start = u64::from_be_bytes(payload[8..16].try_into().unwrap());
                    depiction.push_str(&format!(
                        "│   └── start ts {}, backchain {}, {} payload bytes\n",
                        start,
                        backchain,
                        payload.len() - 16,
                    ));
                }
            }
            RecordType::IV | RecordType::IT => {
                let mut r = RecordReader::new(&payload);
                if let Ok(handle) = r.u32() {
                    depiction.push_str(&format!("│   └── handle {}\n", handle));
                }
            }
            _ => {}
        }

        offset += header.length as u64;
        record_id += 1;
    }

    Ok(depiction)
}
