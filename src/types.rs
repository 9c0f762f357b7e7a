use std::sync::{Arc, RwLock};

use crate::error::DbError;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type DbResult<T> = Result<T, DbError>;
pub type Completion = Result<(), DbError>;

/// Handle of an open volume inside the engine's volume arena.
pub type VolumeHandle = u32;

/// Handle of a tree, assigned when the tree is first identified to the
/// journal.
pub type TreeHandle = u32;

/// 64-bit page number inside a volume. Page 0 is the head page.
pub type PageAddress = u64;

/// Logical clock value. Start and commit timestamps of transactions and
/// the dirty-at timestamps of buffer frames are drawn from the same
/// allocator.
pub type Timestamp = u64;

/// Byte offset into the journal stream. The high bits index the journal
/// file (generation), the low bits the offset within it.
pub type JournalAddress = u64;

/// Identifier of a session; claims are owned by sessions.
pub type SessionId = u64;

/// Identity of a page across the engine: buffer pool lookup, claim
/// table and journal page map all key on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub volume: VolumeHandle,
    pub page: PageAddress,
}

impl PageKey {
    pub fn new(volume: VolumeHandle, page: PageAddress) -> PageKey {
        PageKey { volume, page }
    }
}
