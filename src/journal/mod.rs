pub mod manager;
pub mod page_map;
pub mod records;
pub mod recovery;

pub use manager::{JournalManager, TreeInfo, VolumeInfo};
pub use page_map::{PageMap, PageNode, TxMapEntry};
pub use records::RecordType;
pub use recovery::{DefaultRecoveryListener, RecoveryListener, RecoveryPlan};
