pub mod fast_index;
pub mod page;

pub use fast_index::{FastIndex, FastIndexEntry, FastIndexState};
pub use page::{
    max_inline_value, max_key_length, Page, PageRecord, PageType, Position, PutResult,
    SplitPolicy, KEY_BLOCK_START, PAGE_HEADER_SIZE,
};
