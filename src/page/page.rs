use core::fmt;
use std::{convert::TryInto, sync::Mutex};

use log::debug;

use super::fast_index::FastIndex;
use crate::{
    error::DbError,
    key::{common_prefix_len, Key},
    types::{DbResult, PageAddress, Timestamp},
};

/// Fixed page header:
///
/// | offset | field |
/// |---|---|
/// | 0  | `u8`  page type |
/// | 1  | `u8`  flags |
/// | 2  | `u16` keyblock end (one past the last keyblock byte) |
/// | 4  | `u16` alloc (lowest used tailblock byte) |
/// | 6  | `u16` reserved |
/// | 8  | `u64` page address |
/// | 16 | `u64` right sibling (long-record pages: next chain page) |
/// | 24 | `u64` update timestamp |
///
/// Keyblocks are 8 bytes each and grow upward from offset 32:
/// `{tail: u16, ebc: u16, db: u8, flags: u8, reserved: u16}`.
/// Tailblocks grow downward from the page end:
/// `{klen: u16, vlen: u16, flags: u8, reserved: u8}` then the key
/// suffix (its first byte is the db) then the value bytes.
///
/// Long-record pages reuse the keyblock-end slot (offset 2) as the
/// payload length; their payload starts at offset 32.
pub const PAGE_HEADER_SIZE: usize = 32;
pub const KEY_BLOCK_START: usize = 32;
pub const KEYBLOCK_SIZE: usize = 8;
pub const TAILBLOCK_HEADER_SIZE: usize = 6;

/// Tailblock flag: the value bytes are a long-record descriptor.
pub const TB_LONG_RECORD: u8 = 0x01;
/// Keyblock flag: guard key on an index page.
pub const KB_GUARD: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unallocated,
    Data,
    Index,
    LongRecord,
    Garbage,
    Head,
}

impl PageType {
    pub fn to_u8(self) -> u8 {
        match self {
            PageType::Unallocated => 0,
            PageType::Data => 1,
            PageType::Index => 2,
            PageType::LongRecord => 3,
            PageType::Garbage => 4,
            PageType::Head => 5,
        }
    }

    pub fn from_u8(value: u8) -> DbResult<PageType> {
        match value {
            0 => Ok(PageType::Unallocated),
            1 => Ok(PageType::Data),
            2 => Ok(PageType::Index),
            3 => Ok(PageType::LongRecord),
            4 => Ok(PageType::Garbage),
            5 => Ok(PageType::Head),
            _ => Err(DbError::corruption(&format!(
                "invalid page type: {}",
                value
            ))),
        }
    }

    pub fn is_btree(self) -> bool {
        matches!(self, PageType::Data | PageType::Index)
    }
}

/// Result of an in-page search or traverse step. The low 24 bits carry
/// the keyblock index; the high bits signal EXACT, AFTER_RIGHT_EDGE
/// and BEFORE_LEFT_EDGE.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Position(u32);

const FLAG_EXACT: u32 = 0x8000_0000;
const FLAG_AFTER_RIGHT: u32 = 0x4000_0000;
const FLAG_BEFORE_LEFT: u32 = 0x2000_0000;
const INDEX_MASK: u32 = 0x00FF_FFFF;

impl Position {
    pub const AFTER_RIGHT_EDGE: Position = Position(FLAG_AFTER_RIGHT);
    pub const BEFORE_LEFT_EDGE: Position = Position(FLAG_BEFORE_LEFT);

    pub fn exact(index: usize) -> Position {
        Position(FLAG_EXACT | (index as u32 & INDEX_MASK))
    }

    pub fn before(index: usize) -> Position {
        Position(index as u32 & INDEX_MASK)
    }

    pub fn index(&self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    pub fn is_exact(&self) -> bool {
        self.0 & FLAG_EXACT != 0
    }

    pub fn is_after_right_edge(&self) -> bool {
        self.0 & FLAG_AFTER_RIGHT != 0
    }

    pub fn is_before_left_edge(&self) -> bool {
        self.0 & FLAG_BEFORE_LEFT != 0
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_after_right_edge() {
            return write!(f, "Position(after right edge)");
        }
        if self.is_before_left_edge() {
            return write!(f, "Position(before left edge)");
        }
        write!(
            f,
            "Position({}{})",
            if self.is_exact() { "=" } else { "^" },
            self.index()
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PutResult {
    Stored,
    PageFull,
}

/// How `split` picks its boundary. `ForwardBias` and `ReverseBias`
/// serve sequential insert patterns detected by the level cache: they
/// leave the page on the "filling" side nearly empty so that the next
/// inserts pack densely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    Even,
    ForwardBias,
    ReverseBias,
}

/// A materialized record: full key encoding, value bytes, tailblock
/// flags. Used by split/join, the integrity checker and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u8,
}

/// Largest value stored inline; anything larger goes through a
/// long-record chain.
pub fn max_inline_value(page_size: usize) -> usize {
    page_size / 4
}

/// Largest encoded key a page of this size accepts.
pub fn max_key_length(page_size: usize) -> usize {
    (page_size / 8).min(crate::key::MAX_KEY_LENGTH)
}

pub struct Page {
    bytes: Vec<u8>,
    fast_index: Mutex<FastIndex>,
}

impl Clone for Page {
    fn clone(&self) -> Page {
        Page {
            bytes: self.bytes.clone(),
            fast_index: Mutex::new(FastIndex::new()),
        }
    }
}

impl Page {
    pub fn new(page_size: usize) -> Page {
        Page {
            bytes: vec![0u8; page_size],
            fast_index: Mutex::new(FastIndex::new()),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Page {
        Page {
            bytes,
            fast_index: Mutex::new(FastIndex::new()),
        }
    }

    /// Format this page as an empty page of the given type.
    pub fn init_as(&mut self, page_type: PageType, address: PageAddress) {
        for b in self.bytes.iter_mut() {
            *b = 0;
        }
        self.bytes[0] = page_type.to_u8();
        self.set_keyblock_end(KEY_BLOCK_START);
        self.set_alloc(self.page_size());
        self.set_page_address(address);
        self.set_right_sibling(0);
        self.invalidate_fast_index();
    }

    pub fn page_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn replace_bytes(&mut self, bytes: Vec<u8>) {
        debug_assert_eq!(bytes.len(), self.bytes.len());
        self.bytes = bytes;
        self.invalidate_fast_index();
    }

    // ------------------------------------------------------------------
    // header accessors

    fn get_u16(&self, offset: usize) -> usize {
        u16::from_be_bytes(self.bytes[offset..offset + 2].try_into().unwrap()) as usize
    }

    fn put_u16(&mut self, offset: usize, value: usize) {
        debug_assert!(value <= u16::MAX as usize);
        self.bytes[offset..offset + 2].copy_from_slice(&(value as u16).to_be_bytes());
    }

    fn get_u64(&self, offset: usize) -> u64 {
        u64::from_be_bytes(self.bytes[offset..offset + 8].try_into().unwrap())
    }

    fn put_u64(&mut self, offset: usize, value: u64) {
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    pub fn page_type(&self) -> DbResult<PageType> {
        PageType::from_u8(self.bytes[0])
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.bytes[0] = page_type.to_u8();
    }

    pub fn keyblock_end(&self) -> usize {
        self.get_u16(2)
    }

    fn set_keyblock_end(&mut self, value: usize) {
        self.put_u16(2, value);
    }

    pub fn alloc(&self) -> usize {
        self.get_u16(4)
    }

    fn set_alloc(&mut self, value: usize) {
        self.put_u16(4, value);
    }

    pub fn page_address(&self) -> PageAddress {
        self.get_u64(8)
    }

    pub fn set_page_address(&mut self, address: PageAddress) {
        self.put_u64(8, address);
    }

    pub fn right_sibling(&self) -> PageAddress {
        self.get_u64(16)
    }

    pub fn set_right_sibling(&mut self, address: PageAddress) {
        self.put_u64(16, address);
    }

    pub fn timestamp(&self) -> Timestamp {
        self.get_u64(24)
    }

    pub fn set_timestamp(&mut self, ts: Timestamp) {
        self.put_u64(24, ts);
    }

    /// Number of keyblocks, guards included.
    pub fn key_count(&self) -> usize {
        (self.keyblock_end() - KEY_BLOCK_START) / KEYBLOCK_SIZE
    }

    /// Free contiguous bytes between the keyblock vector and the tail
    /// region.
    pub fn free_space(&self) -> usize {
        self.alloc().saturating_sub(self.keyblock_end())
    }

    // ------------------------------------------------------------------
    // long-record payload (LongRecord pages only)

    pub fn long_payload_capacity(page_size: usize) -> usize {
        page_size - PAGE_HEADER_SIZE
    }

    pub fn long_payload(&self) -> &[u8] {
        let len = self.get_u16(2);
        &self.bytes[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len]
    }

    pub fn set_long_payload(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= Self::long_payload_capacity(self.page_size()));
        self.put_u16(2, payload.len());
        self.bytes[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    }

    // ------------------------------------------------------------------
    // keyblock / tailblock accessors

    fn kb_offset(&self, index: usize) -> usize {
        KEY_BLOCK_START + index * KEYBLOCK_SIZE
    }

    fn kb_tail(&self, index: usize) -> usize {
        self.get_u16(self.kb_offset(index))
    }

    fn set_kb_tail(&mut self, index: usize, tail: usize) {
        let off = self.kb_offset(index);
        self.put_u16(off, tail);
    }

    pub fn kb_ebc(&self, index: usize) -> usize {
        self.get_u16(self.kb_offset(index) + 2)
    }

    fn set_kb_ebc(&mut self, index: usize, ebc: usize) {
        let off = self.kb_offset(index);
        self.put_u16(off + 2, ebc);
    }

    pub fn kb_db(&self, index: usize) -> u8 {
        self.bytes[self.kb_offset(index) + 4]
    }

    fn set_kb_db(&mut self, index: usize, db: u8) {
        let off = self.kb_offset(index);
        self.bytes[off + 4] = db;
    }

    pub fn kb_flags(&self, index: usize) -> u8 {
        self.bytes[self.kb_offset(index) + 5]
    }

    fn set_kb_flags(&mut self, index: usize, flags: u8) {
        let off = self.kb_offset(index);
        self.bytes[off + 5] = flags;
    }

    pub fn is_guard(&self, index: usize) -> bool {
        self.kb_flags(index) & KB_GUARD != 0
    }

    fn tb_klen(&self, tail: usize) -> usize {
        self.get_u16(tail)
    }

    fn tb_vlen(&self, tail: usize) -> usize {
        self.get_u16(tail + 2)
    }

    pub fn tb_flags_at(&self, index: usize) -> u8 {
        let tail = self.kb_tail(index);
        self.bytes[tail + 4]
    }

    /// Key suffix of the keyblock (first byte is the db).
    pub fn suffix_at(&self, index: usize) -> &[u8] {
        let tail = self.kb_tail(index);
        let klen = self.tb_klen(tail);
        &self.bytes[tail + TAILBLOCK_HEADER_SIZE..tail + TAILBLOCK_HEADER_SIZE + klen]
    }

    pub fn value_at(&self, index: usize) -> &[u8] {
        let tail = self.kb_tail(index);
        let klen = self.tb_klen(tail);
        let vlen = self.tb_vlen(tail);
        let start = tail + TAILBLOCK_HEADER_SIZE + klen;
        &self.bytes[start..start + vlen]
    }

    pub fn is_long_record(&self, index: usize) -> bool {
        self.tb_flags_at(index) & TB_LONG_RECORD != 0
    }

    /// Child pointer of an index-page record.
    pub fn child_at(&self, index: usize) -> DbResult<PageAddress> {
        let value = self.value_at(index);
        if value.len() != 8 {
            return Err(DbError::corruption(&format!(
                "index record {} has a {}-byte child pointer",
                index,
                value.len()
            )));
        }
        Ok(u64::from_be_bytes(value.try_into().unwrap()))
    }

    /// Reconstruct the full key at `index` by walking the ebc chain
    /// from the head of the page.
    pub fn key_at(&self, index: usize, out: &mut Vec<u8>) {
        out.clear();
        for i in 0..=index {
            out.truncate(self.kb_ebc(i));
            out.extend_from_slice(self.suffix_at(i));
        }
    }

    /// Advance `buf` (holding the full key at `index - 1`) to the full
    /// key at `index`. O(1) step used by sequential traversal.
    pub fn apply_keyblock(&self, index: usize, buf: &mut Vec<u8>) {
        buf.truncate(self.kb_ebc(index));
        buf.extend_from_slice(self.suffix_at(index));
    }

    // ------------------------------------------------------------------
    // fast index

    pub fn invalidate_fast_index(&self) {
        self.fast_index.lock().unwrap().invalidate();
    }

    fn keyblock_summary(&self) -> Vec<(u16, u8)> {
        (0..self.key_count())
            .map(|i| (self.kb_ebc(i) as u16, self.kb_db(i)))
            .collect()
    }

    fn patch_fast_index_insert(&self, index: usize) {
        let mut guard = self.fast_index.lock().unwrap();
        let summary = self.keyblock_summary();
        guard.patch_insert(index, &summary);
    }

    // ------------------------------------------------------------------
    // find

    /// Search for `key`. Returns `EXACT` at the matching keyblock, or
    /// `BEFORE i` when the key sorts immediately before keyblock `i`
    /// (`i == key_count()` puts it after every key on the page).
    ///
    /// The scan walks the keyblock vector consulting ebc/db only,
    /// touching a tailblock just when the elision count matches the
    /// number of bytes already matched; with a valid fast index, whole
    /// runs and subordinate nestings are skipped without being read.
    pub fn find_key(&self, key: &[u8]) -> Position {
        let n = self.key_count();

        // lazy build on first search after a modification
        let mut index_guard = self.fast_index.lock().unwrap();
        if !index_guard.is_valid() {
            index_guard.rebuild(&self.keyblock_summary());
        }

        let mut matched = 0usize;
        let mut i = 0usize;

        while i < n {
            if self.is_guard(i) && i > 0 {
                // right guard: everything sorts before it
                return Position::before(i);
            }

            let e = self.kb_ebc(i);

            if e > matched {
                // shares more with its predecessor than the search key
                // does: smaller than the search key, skip the whole
                // nesting
                let count = index_guard.count(i);
                i += if count < 0 { (-count) as usize } else { count as usize };
                continue;
            }

            if e < matched {
                // diverges from the chain where the search key still
                // agrees with it: greater than the search key
                return Position::before(i);
            }

            // e == matched: the discriminator byte decides
            if matched >= key.len() {
                // the search key is exhausted; it is a prefix of (or
                // equal to) this key
                if self.suffix_at(i).is_empty() {
                    return Position::exact(i);
                }
                return Position::before(i);
            }

            let target = key[matched];
            let db = self.kb_db(i);

            if db > target {
                return Position::before(i);
            }
            if db < target {
                let count = index_guard.count(i);
                if count < 0 {
                    // this key and its whole subordinate nesting are
                    // smaller; hop to the next sibling and compare its
                    // db on the next turn
                    i += (-count) as usize;
                    continue;
                }
                // binary search the contiguous equal-ebc run for the
                // target discriminator
                let run = (count as usize).min(n - i);
                let (pos, found) = self.run_search(i, run, target);
                if !found {
                    if pos < i + run {
                        // inside the run with db > target
                        return Position::before(pos);
                    }
                    // every run member was smaller; whatever follows
                    // the run (children of its last member, a
                    // shallower level, or the page end) is decided by
                    // the main loop
                    i = pos;
                    continue;
                }
                if self.is_guard(pos) && pos > 0 {
                    return Position::before(pos);
                }
                i = pos;
            }

            // db matches: compare the remaining suffix bytes
            let suffix = self.suffix_at(i);
            let rest = &key[matched..];
            let limit = suffix.len().min(rest.len());
            let c = common_prefix_len(&suffix[..limit], &rest[..limit]);

            if c < limit {
                if rest[c] < suffix[c] {
                    return Position::before(i);
                }
                matched = e + c;
                i += 1;
                continue;
            }
            if rest.len() == suffix.len() {
                return Position::exact(i);
            }
            if rest.len() < suffix.len() {
                // search key is a strict prefix
                return Position::before(i);
            }
            // this key is a strict prefix of the search key
            matched = e + suffix.len();
            i += 1;
        }

        Position::before(n)
    }

    /// Binary search `[start, start + run)` (an equal-ebc run) for the
    /// first keyblock whose db is >= `target`. Returns the index and
    /// whether the db matched exactly.
    fn run_search(&self, start: usize, run: usize, target: u8) -> (usize, bool) {
        let mut lo = start;
        let mut hi = start + run;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.kb_db(mid) < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < start + run && self.kb_db(lo) == target {
            (lo, true)
        } else {
            (lo, false)
        }
    }

    // ------------------------------------------------------------------
    // put

    /// Insert or replace a record. `position` must come from a
    /// `find_key` for the same key on the current page content.
    pub fn put_value(
        &mut self,
        key: &[u8],
        value: &[u8],
        tb_flags: u8,
        position: Position,
        replace: bool,
    ) -> DbResult<PutResult> {
        if position.is_exact() {
            if !replace {
                return Err(DbError::validation("key already present"));
            }
            let index = position.index();
            if !self.remove_keys(index, index + 1)? {
                return Err(DbError::corruption("replace lost its target keyblock"));
            }
            return self.insert_at(key, value, tb_flags, index, false);
        }
        self.insert_at(key, value, tb_flags, position.index(), true)
    }

    fn insert_at(
        &mut self,
        key: &[u8],
        value: &[u8],
        tb_flags: u8,
        index: usize,
        patch_index: bool,
    ) -> DbResult<PutResult> {
        let n = self.key_count();
        debug_assert!(index <= n);

        let mut scratch = Vec::new();

        // ebc against the predecessor
        let ebc = if index == 0 {
            0
        } else {
            self.key_at(index - 1, &mut scratch);
            common_prefix_len(&scratch, key)
        };
        if ebc >= key.len() {
            return Err(DbError::corruption(
                "inserted key does not extend its predecessor",
            ));
        }
        let suffix_len = key.len() - ebc;
        let new_tail = TAILBLOCK_HEADER_SIZE + suffix_len + value.len();

        // the successor's elision count may change; its tailblock is
        // rewritten when it does
        let mut succ_fix: Option<(usize, Vec<u8>, Vec<u8>, u8)> = None;
        if index < n {
            self.key_at(index, &mut scratch);
            let succ_ebc = if self.is_guard(index) && index > 0 {
                // the right guard never elides
                self.kb_ebc(index)
            } else {
                common_prefix_len(key, &scratch)
            };
            if succ_ebc != self.kb_ebc(index) {
                let suffix = scratch[succ_ebc..].to_vec();
                let val = self.value_at(index).to_vec();
                let flags = self.tb_flags_at(index);
                succ_fix = Some((succ_ebc, suffix, val, flags));
            }
        }

        let succ_tail = succ_fix
            .as_ref()
            .map(|(_, s, v, _)| TAILBLOCK_HEADER_SIZE + s.len() + v.len())
            .unwrap_or(0);
        let needed = KEYBLOCK_SIZE + new_tail + succ_tail;

        if self.free_space() < needed {
            self.rebuild_tails()?;
            if self.free_space() < needed {
                return Ok(PutResult::PageFull);
            }
        }

        // shift the keyblock vector right
        let kb_end = self.keyblock_end();
        let from = self.kb_offset(index);
        self.bytes.copy_within(from..kb_end, from + KEYBLOCK_SIZE);
        self.set_keyblock_end(kb_end + KEYBLOCK_SIZE);

        // new tailblock
        let tail = self.write_tailblock(&key[ebc..], value, tb_flags);
        self.set_kb_tail(index, tail);
        self.set_kb_ebc(index, ebc);
        self.set_kb_db(index, key[ebc]);
        self.set_kb_flags(index, 0);

        // refix the successor
        if let Some((succ_ebc, suffix, val, flags)) = succ_fix {
            let succ = index + 1;
            let tail = self.write_tailblock(&suffix, &val, flags);
            self.set_kb_tail(succ, tail);
            self.set_kb_ebc(succ, succ_ebc);
            if !suffix.is_empty() {
                self.set_kb_db(succ, suffix[0]);
            }
        }

        if patch_index {
            self.patch_fast_index_insert(index);
        } else {
            self.invalidate_fast_index();
        }
        Ok(PutResult::Stored)
    }

    fn write_tailblock(&mut self, suffix: &[u8], value: &[u8], flags: u8) -> usize {
        let size = TAILBLOCK_HEADER_SIZE + suffix.len() + value.len();
        let tail = self.alloc() - size;
        debug_assert!(tail >= self.keyblock_end());

        self.put_u16(tail, suffix.len());
        self.put_u16(tail + 2, value.len());
        self.bytes[tail + 4] = flags;
        self.bytes[tail + 5] = 0;
        let ks = tail + TAILBLOCK_HEADER_SIZE;
        self.bytes[ks..ks + suffix.len()].copy_from_slice(suffix);
        self.bytes[ks + suffix.len()..ks + suffix.len() + value.len()].copy_from_slice(value);

        self.set_alloc(tail);
        tail
    }

    /// Repack the tail region so that only live tailblocks remain and
    /// `alloc` is tight.
    fn rebuild_tails(&mut self) -> DbResult<()> {
        let n = self.key_count();
        let mut live: Vec<(Vec<u8>, Vec<u8>, u8)> = Vec::with_capacity(n);
        for i in 0..n {
            live.push((
                self.suffix_at(i).to_vec(),
                self.value_at(i).to_vec(),
                self.tb_flags_at(i),
            ));
        }

        self.set_alloc(self.page_size());
        for (i, (suffix, value, flags)) in live.into_iter().enumerate() {
            let size = TAILBLOCK_HEADER_SIZE + suffix.len() + value.len();
            if self.alloc() < self.keyblock_end() + size {
                return Err(DbError::corruption("tail region underflow while repacking"));
            }
            let tail = self.write_tailblock(&suffix, &value, flags);
            self.set_kb_tail(i, tail);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // remove

    /// Remove the half-open keyblock range `[from, to)`, compacting the
    /// tail region and refixing the successor's ebc/db.
    pub fn remove_keys(&mut self, from: usize, to: usize) -> DbResult<bool> {
        let n = self.key_count();
        if from >= to || to > n {
            return Ok(false);
        }
        debug_assert!(!self.is_guard(from) || from == 0);

        // the successor's new predecessor is the key at from-1
        let mut succ_fix: Option<(usize, Vec<u8>, Vec<u8>, u8)> = None;
        if to < n && !(self.is_guard(to) && to > 0) {
            let mut pred = Vec::new();
            if from > 0 {
                self.key_at(from - 1, &mut pred);
            }
            let mut succ = Vec::new();
            self.key_at(to, &mut succ);

            let new_ebc = common_prefix_len(&pred, &succ);
            if new_ebc != self.kb_ebc(to) {
                succ_fix = Some((
                    new_ebc,
                    succ[new_ebc..].to_vec(),
                    self.value_at(to).to_vec(),
                    self.tb_flags_at(to),
                ));
            }
        }

        // shift the keyblock vector left over the removed range
        let kb_end = self.keyblock_end();
        let dst = self.kb_offset(from);
        let src = self.kb_offset(to);
        self.bytes.copy_within(src..kb_end, dst);
        self.set_keyblock_end(kb_end - (to - from) * KEYBLOCK_SIZE);

        if let Some((new_ebc, suffix, value, flags)) = succ_fix {
            self.set_kb_ebc(from, new_ebc);
            if !suffix.is_empty() {
                self.set_kb_db(from, suffix[0]);
            }
            // write the widened suffix through the repack path so that
            // the dead tailblocks of the removed range are reclaimed
            // first
            self.set_kb_tail(from, 0);
            self.rebuild_tails_with_pending(from, &suffix, &value, flags)?;
        } else {
            self.rebuild_tails()?;
        }

        self.invalidate_fast_index();
        Ok(true)
    }

    fn rebuild_tails_with_pending(
        &mut self,
        pending: usize,
        suffix: &[u8],
        value: &[u8],
        flags: u8,
    ) -> DbResult<()> {
        let n = self.key_count();
        let mut live: Vec<(Vec<u8>, Vec<u8>, u8)> = Vec::with_capacity(n);
        for i in 0..n {
            if i == pending {
                live.push((suffix.to_vec(), value.to_vec(), flags));
            } else {
                live.push((
                    self.suffix_at(i).to_vec(),
                    self.value_at(i).to_vec(),
                    self.tb_flags_at(i),
                ));
            }
        }

        self.set_alloc(self.page_size());
        for (i, (suffix, value, flags)) in live.into_iter().enumerate() {
            let size = TAILBLOCK_HEADER_SIZE + suffix.len() + value.len();
            if self.alloc() < self.keyblock_end() + size {
                return Err(DbError::corruption("tail region underflow while repacking"));
            }
            let tail = self.write_tailblock(&suffix, &value, flags);
            self.set_kb_tail(i, tail);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // records (split / join / integrity / tests)

    /// Materialize every non-guard record. For index pages the left
    /// guard's value (the leftmost child pointer) is returned
    /// separately.
    pub fn decode_records(&self) -> DbResult<(Vec<PageRecord>, Vec<u8>)> {
        let n = self.key_count();
        let mut records = Vec::with_capacity(n);
        let mut left_guard_value = Vec::new();
        let mut key = Vec::new();

        for i in 0..n {
            self.apply_keyblock(i, &mut key);
            if self.is_guard(i) {
                if i == 0 {
                    left_guard_value = self.value_at(i).to_vec();
                }
                continue;
            }
            records.push(PageRecord {
                key: key.clone(),
                value: self.value_at(i).to_vec(),
                flags: self.tb_flags_at(i),
            });
        }
        Ok((records, left_guard_value))
    }

    /// Re-encode the page body from scratch. Index pages receive the
    /// guard pair; `left_guard_value` carries the leftmost child of a
    /// leftmost index page (empty otherwise).
    pub fn encode_records(
        &mut self,
        records: &[PageRecord],
        left_guard_value: &[u8],
    ) -> DbResult<PutResult> {
        let page_type = self.page_type()?;
        let address = self.page_address();
        let right = self.right_sibling();
        let ts = self.timestamp();

        match encode_into(
            self.page_size(),
            page_type,
            address,
            right,
            ts,
            records,
            left_guard_value,
        )? {
            Some(bytes) => {
                self.replace_bytes(bytes);
                Ok(PutResult::Stored)
            }
            None => Ok(PutResult::PageFull),
        }
    }

    /// Sum of the encoded sizes of the given records (ebc compression
    /// not counted, which makes the estimate conservative).
    pub fn records_size(records: &[PageRecord]) -> usize {
        records
            .iter()
            .map(|r| KEYBLOCK_SIZE + TAILBLOCK_HEADER_SIZE + r.key.len() + r.value.len())
            .sum()
    }

    // ------------------------------------------------------------------
    // split / join

    /// Partition this page's records (with the pending insert of
    /// `insert_size` bytes at `position` accounted for) between `self`
    /// and the empty `right` page. Returns the split key: the first key
    /// of the right page, or the insert key itself when the policy
    /// moves nothing (sequential append).
    ///
    /// The caller chains the sibling pointers beforehand is not
    /// required: this routine links `right` between `self` and the old
    /// right sibling.
    pub fn split(
        &mut self,
        right: &mut Page,
        insert_key: &[u8],
        insert_size: usize,
        position: Position,
        policy: SplitPolicy,
    ) -> DbResult<Key> {
        let (records, left_guard) = self.decode_records()?;
        let n = records.len();
        if n == 0 {
            return Err(DbError::corruption("splitting an empty page"));
        }
        let insert_index = self.record_index(position);

        let s = self.choose_split(&records, insert_index, insert_size, policy, n);
        let split_key = if s == n {
            Key::from_encoded(insert_key)
        } else {
            Key::from_encoded(&records[s].key)
        };

        debug!(
            "split page {}: {} records, boundary {}, insert at {}",
            self.page_address(),
            n,
            s,
            insert_index
        );

        right.set_right_sibling(self.right_sibling());
        right.set_timestamp(self.timestamp());
        self.set_right_sibling(right.page_address());

        // the right half of an index level never owns a leftmost child
        if right.encode_records(&records[s..], &[])? == PutResult::PageFull {
            return Err(DbError::corruption("split right half does not fit"));
        }
        if self.encode_records(&records[..s], &left_guard)? == PutResult::PageFull {
            return Err(DbError::corruption("split left half does not fit"));
        }

        Ok(split_key)
    }

    /// Convert a position into an index over the non-guard records.
    fn record_index(&self, position: Position) -> usize {
        let mut idx = position.index().min(self.key_count());
        // discount the left guard
        if self.key_count() > 0 && self.is_guard(0) && idx > 0 {
            idx -= 1;
        }
        // clamp away the right guard
        let n = self.key_count();
        if n >= 2 && self.is_guard(n - 1) {
            idx = idx.min(n - 2);
        }
        idx
    }

    fn choose_split(
        &self,
        records: &[PageRecord],
        insert_index: usize,
        insert_size: usize,
        policy: SplitPolicy,
        n: usize,
    ) -> usize {
        match policy {
            SplitPolicy::ForwardBias if insert_index >= n => {
                // ascending fill: keep the packed left page whole and
                // open an empty right page for the incoming key
                return n;
            }
            SplitPolicy::ReverseBias if insert_index == 0 => {
                return 1.min(n);
            }
            _ => {}
        }

        // balance encoded bytes, counting the pending insert on the
        // side its position puts it
        let sizes: Vec<usize> = records
            .iter()
            .map(|r| KEYBLOCK_SIZE + TAILBLOCK_HEADER_SIZE + r.key.len() + r.value.len())
            .collect();
        let total: usize = sizes.iter().sum::<usize>() + insert_size;

        let mut best = 1;
        let mut best_diff = usize::MAX;
        let mut left = 0usize;
        for s in 1..n {
            left += sizes[s - 1];
            let with_insert = if insert_index < s { left + insert_size } else { left };
            let diff = if with_insert * 2 > total {
                with_insert * 2 - total
            } else {
                total - with_insert * 2
            };
            if diff < best_diff {
                best_diff = diff;
                best = s;
            }
        }
        best
    }

    /// Either coalesce `right` into `self` (returns `None`; the caller
    /// frees the right page) or redistribute records between the two
    /// (returns the new split key to reindex into the parent).
    pub fn join(&mut self, right: &mut Page, _policy: SplitPolicy) -> DbResult<Option<Key>> {
        let (mut left_records, left_guard) = self.decode_records()?;
        let (right_records, _) = right.decode_records()?;

        let guard_overhead = match self.page_type()? {
            PageType::Index => 2 * (KEYBLOCK_SIZE + TAILBLOCK_HEADER_SIZE + 8),
            _ => 0,
        };
        let combined = Self::records_size(&left_records)
            + Self::records_size(&right_records)
            + guard_overhead
            + PAGE_HEADER_SIZE;

        left_records.extend(right_records);

        if combined <= self.page_size() {
            // coalesce; the right page keeps its stale content until
            // the caller unlinks it from the parent and stamps it onto
            // the garbage chain
            let sibling = right.right_sibling();
            if self.encode_records(&left_records, &left_guard)? == PutResult::PageFull {
                // the conservative estimate was wrong only if the page
                // is pathologically incompressible; fall through to a
                // redistribution instead
                return self.redistribute(right, left_records, left_guard);
            }
            self.set_right_sibling(sibling);
            return Ok(None);
        }

        self.redistribute(right, left_records, left_guard)
    }

    fn redistribute(
        &mut self,
        right: &mut Page,
        records: Vec<PageRecord>,
        left_guard: Vec<u8>,
    ) -> DbResult<Option<Key>> {
        let n = records.len();
        if n < 2 {
            return Err(DbError::corruption("redistributing fewer than two records"));
        }

        let sizes: Vec<usize> = records
            .iter()
            .map(|r| KEYBLOCK_SIZE + TAILBLOCK_HEADER_SIZE + r.key.len() + r.value.len())
            .collect();
        let total: usize = sizes.iter().sum();

        let mut best = 1;
        let mut best_diff = usize::MAX;
        let mut left = 0usize;
        for s in 1..n {
            left += sizes[s - 1];
            let diff = if left * 2 > total { left * 2 - total } else { total - left * 2 };
            if diff < best_diff {
                best_diff = diff;
                best = s;
            }
        }

        let split_key = Key::from_encoded(&records[best].key);
        if right.encode_records(&records[best..], &[])? == PutResult::PageFull
            || self.encode_records(&records[..best], &left_guard)? == PutResult::PageFull
        {
            return Err(DbError::corruption("redistribution does not fit"));
        }
        Ok(Some(split_key))
    }

    // ------------------------------------------------------------------
    // traverse

    /// Step to the next record position in the requested direction,
    /// skipping guards. `AFTER_RIGHT_EDGE` tells the caller to follow
    /// the right sibling; `BEFORE_LEFT_EDGE` to re-descend for the
    /// predecessor.
    pub fn traverse(&self, position: Position, forward: bool) -> Position {
        let n = self.key_count();
        let mut i: isize = if position.is_before_left_edge() {
            -1
        } else {
            position.index() as isize
        };

        loop {
            i += if forward { 1 } else { -1 };
            if i < 0 {
                return Position::BEFORE_LEFT_EDGE;
            }
            if i as usize >= n {
                return Position::AFTER_RIGHT_EDGE;
            }
            if self.is_guard(i as usize) {
                continue;
            }
            return Position::exact(i as usize);
        }
    }

    /// Position of the first non-guard record.
    pub fn first_record(&self) -> Option<usize> {
        (0..self.key_count()).find(|i| !self.is_guard(*i))
    }

    /// Position of the last non-guard record.
    pub fn last_record(&self) -> Option<usize> {
        (0..self.key_count()).rev().find(|i| !self.is_guard(*i))
    }

    /// Number of non-guard records.
    pub fn record_count(&self) -> usize {
        (0..self.key_count()).filter(|i| !self.is_guard(*i)).count()
    }

    /// First non-guard key, if any.
    pub fn first_key(&self) -> Option<Key> {
        let i = self.first_record()?;
        let mut buf = Vec::new();
        self.key_at(i, &mut buf);
        Some(Key::from_encoded(&buf))
    }
}

/// Build a fresh page image from records. Returns `None` when the
/// records do not fit.
pub fn encode_into(
    page_size: usize,
    page_type: PageType,
    address: PageAddress,
    right_sibling: PageAddress,
    timestamp: Timestamp,
    records: &[PageRecord],
    left_guard_value: &[u8],
) -> DbResult<Option<Vec<u8>>> {
    let mut page = Page::new(page_size);
    page.init_as(page_type, address);
    page.set_right_sibling(right_sibling);
    page.set_timestamp(timestamp);

    let with_guards = page_type == PageType::Index;

    // all tailblocks are measured up front so that a misfit is detected
    // before any byte moves
    let mut prev: &[u8] = &[];
    let mut body = KEY_BLOCK_START;
    let mut tail_bytes = 0usize;
    for r in records.iter() {
        if !prev.is_empty() && r.key.as_slice() <= prev {
            return Err(DbError::corruption("records out of order while encoding"));
        }
        let ebc = common_prefix_len(prev, &r.key);
        body += KEYBLOCK_SIZE;
        tail_bytes += TAILBLOCK_HEADER_SIZE + (r.key.len() - ebc) + r.value.len();
        prev = &r.key;
    }
    if with_guards {
        body += 2 * KEYBLOCK_SIZE;
        tail_bytes += 2 * TAILBLOCK_HEADER_SIZE + left_guard_value.len();
    }
    if body + tail_bytes > page_size {
        return Ok(None);
    }

    let mut index = 0usize;
    if with_guards {
        let tail = page.write_tailblock(&[], left_guard_value, 0);
        page.set_keyblock_end(KEY_BLOCK_START + KEYBLOCK_SIZE);
        page.set_kb_tail(0, tail);
        page.set_kb_ebc(0, 0);
        page.set_kb_db(0, 0);
        page.set_kb_flags(0, KB_GUARD);
        index = 1;
    }

    let mut prev: Vec<u8> = Vec::new();
    for r in records.iter() {
        let ebc = common_prefix_len(&prev, &r.key);
        let tail = page.write_tailblock(&r.key[ebc..], &r.value, r.flags);
        page.set_keyblock_end(KEY_BLOCK_START + (index + 1) * KEYBLOCK_SIZE);
        page.set_kb_tail(index, tail);
        page.set_kb_ebc(index, ebc);
        page.set_kb_db(index, r.key[ebc]);
        page.set_kb_flags(index, 0);
        prev = r.key.clone();
        index += 1;
    }

    if with_guards {
        let tail = page.write_tailblock(&[], &[], 0);
        page.set_keyblock_end(KEY_BLOCK_START + (index + 1) * KEYBLOCK_SIZE);
        page.set_kb_tail(index, tail);
        page.set_kb_ebc(index, 0);
        page.set_kb_db(index, 0xFF);
        page.set_kb_flags(index, KB_GUARD);
    }

    Ok(Some(page.bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_bytes(parts: &[&[u8]]) -> Vec<u8> {
        let mut k = Key::new();
        for p in parts {
            k.append(p).unwrap();
        }
        k.encoded().to_vec()
    }

    fn data_page(page_size: usize) -> Page {
        let mut p = Page::new(page_size);
        p.init_as(PageType::Data, 7);
        p
    }

    fn insert(page: &mut Page, key: &[u8], value: &[u8]) -> PutResult {
        let pos = page.find_key(key);
        page.put_value(key, value, 0, pos, true).unwrap()
    }

    #[test]
    fn empty_page_search() {
        let p = data_page(1024);
        let k = key_bytes(&[&[1]]);
        let pos = p.find_key(&k);
        assert!(!pos.is_exact());
        assert_eq!(pos.index(), 0);
    }

    #[test]
    fn insert_and_find() {
        let mut p = data_page(4096);
        for i in [5u8, 1, 9, 3, 7].iter() {
            let k = key_bytes(&[&[*i]]);
            assert_eq!(insert(&mut p, &k, &[*i, *i]), PutResult::Stored);
        }
        assert_eq!(p.key_count(), 5);

        for i in [1u8, 3, 5, 7, 9].iter() {
            let k = key_bytes(&[&[*i]]);
            let pos = p.find_key(&k);
            assert!(pos.is_exact(), "key {} not found", i);
            assert_eq!(p.value_at(pos.index()), &[*i, *i]);
        }

        let missing = key_bytes(&[&[4]]);
        let pos = p.find_key(&missing);
        assert!(!pos.is_exact());
        // lands just before [5]
        let mut buf = Vec::new();
        p.key_at(pos.index(), &mut buf);
        assert_eq!(buf, key_bytes(&[&[5]]));
    }

    #[test]
    fn keys_stay_sorted_and_compressed() {
        let mut p = data_page(4096);
        let keys: Vec<Vec<u8>> = vec![
            key_bytes(&[b"aaa"]),
            key_bytes(&[b"aab"]),
            key_bytes(&[b"aac"]),
            key_bytes(&[b"abc"]),
            key_bytes(&[b"b"]),
        ];
        for k in keys.iter().rev() {
            insert(&mut p, k, b"v");
        }

        let mut buf = Vec::new();
        for (i, k) in keys.iter().enumerate() {
            p.key_at(i, &mut buf);
            assert_eq!(&buf, k);
        }
        // "aab" after "aaa" elides two bytes
        assert_eq!(p.kb_ebc(1), 2);
        assert_eq!(p.kb_db(1), b'b');
        // "b" after "abc\0" shares nothing
        assert_eq!(p.kb_ebc(4), 0);
    }

    #[test]
    fn replace_keeps_single_entry() {
        let mut p = data_page(1024);
        let k = key_bytes(&[&[8]]);
        insert(&mut p, &k, b"one");
        insert(&mut p, &k, b"two");
        assert_eq!(p.key_count(), 1);
        let pos = p.find_key(&k);
        assert!(pos.is_exact());
        assert_eq!(p.value_at(pos.index()), b"two");
    }

    #[test]
    fn remove_refixes_successor() {
        let mut p = data_page(4096);
        let a = key_bytes(&[b"aaa"]);
        let b = key_bytes(&[b"aab"]);
        let c = key_bytes(&[b"aac"]);
        insert(&mut p, &a, b"1");
        insert(&mut p, &b, b"2");
        insert(&mut p, &c, b"3");

        // drop the middle key; "aac" now elides against "aaa"
        assert!(p.remove_keys(1, 2).unwrap());
        assert_eq!(p.key_count(), 2);
        let mut buf = Vec::new();
        p.key_at(1, &mut buf);
        assert_eq!(buf, c);
        assert!(p.find_key(&b).is_exact() == false);
        assert!(p.find_key(&c).is_exact());
    }

    #[test]
    fn remove_first_key() {
        let mut p = data_page(4096);
        let a = key_bytes(&[b"aaa"]);
        let b = key_bytes(&[b"aab"]);
        insert(&mut p, &a, b"1");
        insert(&mut p, &b, b"2");

        assert!(p.remove_keys(0, 1).unwrap());
        assert_eq!(p.key_count(), 1);
        assert_eq!(p.kb_ebc(0), 0);
        let pos = p.find_key(&b);
        assert!(pos.is_exact());
        assert_eq!(p.value_at(pos.index()), b"2");
    }

    #[test]
    fn page_fills_up() {
        let mut p = data_page(1024);
        let value = vec![0u8; 64];
        let mut stored = 0;
        for i in 0..64u8 {
            let k = key_bytes(&[&[i, i, i]]);
            match insert(&mut p, &k, &value) {
                PutResult::Stored => stored += 1,
                PutResult::PageFull => break,
            }
        }
        assert!(stored > 4);
        assert!(stored < 64);
        // page still searchable after hitting the wall
        let k = key_bytes(&[&[0, 0, 0]]);
        assert!(p.find_key(&k).is_exact());
    }

    #[test]
    fn split_even_partitions_bytes() {
        let mut left = data_page(2048);
        let value = vec![9u8; 32];
        let mut keys = Vec::new();
        for i in 0..20u8 {
            let k = key_bytes(&[&[i]]);
            insert(&mut left, &k, &value);
            keys.push(k);
        }

        let mut right = Page::new(2048);
        right.init_as(PageType::Data, 8);
        let insert_key = key_bytes(&[&[20]]);
        let pos = left.find_key(&insert_key);
        let split_key = left
            .split(&mut right, &insert_key, 40, pos, SplitPolicy::Even)
            .unwrap();

        assert_eq!(left.right_sibling(), 8);
        let left_count = left.record_count();
        let right_count = right.record_count();
        assert_eq!(left_count + right_count, 20);
        assert!(left_count >= 8 && left_count <= 12);
        assert_eq!(right.first_key().unwrap(), split_key);
    }

    #[test]
    fn split_forward_bias_keeps_left_packed() {
        let mut left = data_page(2048);
        for i in 0..20u8 {
            insert(&mut left, &key_bytes(&[&[i]]), &[0u8; 32]);
        }
        let mut right = Page::new(2048);
        right.init_as(PageType::Data, 9);
        let insert_key = key_bytes(&[&[99]]);
        let pos = left.find_key(&insert_key);
        let split_key = left
            .split(&mut right, &insert_key, 40, pos, SplitPolicy::ForwardBias)
            .unwrap();

        assert_eq!(left.record_count(), 20);
        assert_eq!(right.record_count(), 0);
        assert_eq!(split_key.encoded(), insert_key.as_slice());
    }

    #[test]
    fn join_coalesces_small_pages() {
        let mut left = data_page(2048);
        let mut right = data_page(2048);
        right.set_page_address(8);
        right.set_right_sibling(77);
        insert(&mut left, &key_bytes(&[&[1]]), b"a");
        insert(&mut right, &key_bytes(&[&[5]]), b"b");

        let result = left.join(&mut right, SplitPolicy::Even).unwrap();
        assert!(result.is_none());
        assert_eq!(left.record_count(), 2);
        assert_eq!(left.right_sibling(), 77);
        // the dead right page is only stamped when it reaches the
        // garbage chain
        assert_eq!(right.page_type().unwrap(), PageType::Data);
    }

    #[test]
    fn join_redistributes_large_pages() {
        let mut left = data_page(1024);
        let mut right = data_page(1024);
        right.set_page_address(8);
        let value = vec![1u8; 100];
        for i in 0..6u8 {
            insert(&mut left, &key_bytes(&[&[i]]), &value);
        }
        insert(&mut right, &key_bytes(&[&[10]]), &value);

        let split = left.join(&mut right, SplitPolicy::Even).unwrap();
        let split = split.expect("should redistribute");
        assert_eq!(right.first_key().unwrap(), split);
        assert!(left.record_count() >= 3);
        assert!(right.record_count() >= 3);
    }

    #[test]
    fn index_page_guards() {
        let mut p = Page::new(1024);
        p.init_as(PageType::Index, 3);
        let child0: u64 = 11;
        p.encode_records(&[], &child0.to_be_bytes()).unwrap();

        assert_eq!(p.key_count(), 2);
        assert!(p.is_guard(0));
        assert!(p.is_guard(1));
        assert_eq!(p.record_count(), 0);
        assert_eq!(p.child_at(0).unwrap(), 11);

        // a record lands between the guards
        let k = key_bytes(&[&[5]]);
        let pos = p.find_key(&k);
        assert!(!pos.is_exact());
        assert_eq!(pos.index(), 1);
        let child: u64 = 12;
        p.put_value(&k, &child.to_be_bytes(), 0, pos, true).unwrap();
        assert_eq!(p.key_count(), 3);
        assert!(p.is_guard(2));
        assert_eq!(p.child_at(1).unwrap(), 12);
    }

    #[test]
    fn traverse_walks_in_order() {
        let mut p = data_page(4096);
        for i in [2u8, 4, 6].iter() {
            insert(&mut p, &key_bytes(&[&[*i]]), &[*i]);
        }

        let mut pos = Position::BEFORE_LEFT_EDGE;
        let mut seen = Vec::new();
        loop {
            pos = p.traverse(pos, true);
            if pos.is_after_right_edge() {
                break;
            }
            let mut buf = Vec::new();
            p.key_at(pos.index(), &mut buf);
            seen.push(buf[0]);
        }
        assert_eq!(seen, vec![2, 4, 6]);

        // and back
        let mut pos = Position::AFTER_RIGHT_EDGE;
        let mut seen = Vec::new();
        loop {
            pos = p.traverse(
                if pos.is_after_right_edge() {
                    Position::exact(p.key_count())
                } else {
                    pos
                },
                false,
            );
            if pos.is_before_left_edge() {
                break;
            }
            seen.push(p.suffix_at(pos.index())[0]);
        }
        assert_eq!(seen, vec![6, 4, 2]);
    }

    #[test]
    fn long_payload_round_trip() {
        let mut p = Page::new(1024);
        p.init_as(PageType::LongRecord, 5);
        let payload = vec![3u8; 500];
        p.set_long_payload(&payload);
        assert_eq!(p.long_payload(), payload.as_slice());
        p.set_right_sibling(6);
        assert_eq!(p.right_sibling(), 6);
    }

    #[test]
    fn encode_decode_records_round_trip() {
        let mut p = data_page(4096);
        let records: Vec<PageRecord> = (0..10u8)
            .map(|i| PageRecord {
                key: key_bytes(&[&[i, i]]),
                value: vec![i; 8],
                flags: 0,
            })
            .collect();
        p.encode_records(&records, &[]).unwrap();

        let (decoded, guard) = p.decode_records().unwrap();
        assert_eq!(decoded, records);
        assert!(guard.is_empty());
    }
}
