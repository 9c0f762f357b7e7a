use std::{error::Error, fmt};

use backtrace::Backtrace;
use log::error;

/// The failure classes the engine distinguishes.
///
/// `Retry` never escapes the tree driver: it is converted into a claim
/// upgrade and a restart of the current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad page type, out-of-range pointer, broken long-record chain,
    /// missing journal file, bad record length or type. Unrecoverable
    /// for the affected volume.
    Corruption,

    /// An underlying read/write/extend failed. Only the current
    /// operation fails; the volume remains usable.
    Io,

    /// Volume full, no evictable buffer frame, or a claim timeout.
    /// The caller may retry after releasing resources.
    Exhausted,

    /// Caller error: invalid key size, invalid direction, write on a
    /// read-only volume.
    Validation,

    /// A request needed a stronger claim than it held.
    Retry,
}

#[derive(Debug, Clone)]
pub struct DbError {
    kind: ErrorKind,
    details: String,
}

impl DbError {
    pub fn new(kind: ErrorKind, msg: &str) -> DbError {
        DbError {
            kind,
            details: msg.to_string(),
        }
    }

    pub fn corruption(msg: &str) -> DbError {
        Self::new(ErrorKind::Corruption, msg)
    }

    pub fn io(msg: &str) -> DbError {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn exhausted(msg: &str) -> DbError {
        Self::new(ErrorKind::Exhausted, msg)
    }

    pub fn validation(msg: &str) -> DbError {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn retry(msg: &str) -> DbError {
        Self::new(ErrorKind::Retry, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_retry(&self) -> bool {
        self.kind == ErrorKind::Retry
    }

    pub fn is_corruption(&self) -> bool {
        self.kind == ErrorKind::Corruption
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn show_backtrace(&self) {
        let bt = Backtrace::new();
        error!("{}\n{:?}", self, bt);
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.details)
    }
}

impl Error for DbError {}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> DbError {
        DbError::io(&e.to_string())
    }
}
