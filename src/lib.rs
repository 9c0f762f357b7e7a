pub mod buffer;
pub mod claim;
pub mod config;
pub mod database;
pub mod error;
pub mod io;
pub mod journal;
pub mod key;
pub mod page;
pub mod transaction;
pub mod tree;
pub mod types;
pub mod utils;
pub mod value;
pub mod volume;

pub mod cli;

pub use config::{Config, VolumeSpec};
pub use database::Database;
pub use error::{DbError, ErrorKind};
pub use key::{Direction, Key, KeyFilter, RangeKeyFilter};
pub use transaction::Transaction;
pub use tree::{cursor::Cursor, Tree};
pub use types::{Completion, DbResult};
pub use value::Value;
