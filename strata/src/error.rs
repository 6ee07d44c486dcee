//! Error types shared by every layer of the engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::lock_table::LockError;
use crate::{Uid, Xid};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Provisioning ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file already exists: '{path}'")]
    FileExists { path: PathBuf },

    #[error("file does not exist: '{path}'")]
    FileNotExists { path: PathBuf },

    #[error("file cannot be read or written: '{path}'")]
    FileCannotReadWrite { path: PathBuf },

    /// The configured cache memory holds fewer pages than the cache needs to operate.
    #[error("memory too small: {pages} pages, need at least {min}")]
    MemTooSmall { pages: usize, min: usize },

    #[error("invalid memory size: '{value}'")]
    InvalidMemory { value: String },

    // === Integrity ===
    #[error("log file is corrupt")]
    BadLogFile,

    #[error("xid file is corrupt: {detail}")]
    BadXidFile { detail: String },

    #[error("malformed log record: {detail}")]
    BadLogRecord { detail: String },

    // === Capacity ===
    #[error("cache is full")]
    CacheFull,

    #[error("record of {size} bytes exceeds the page capacity of {max} bytes")]
    DataTooLarge { size: usize, max: usize },

    /// No page with enough room could be claimed within the insert retry bound.
    #[error("database is busy")]
    DatabaseBusy,

    // === Concurrency ===
    /// Raised for both deadlocks and version skips; the transaction has been aborted.
    #[error("concurrent update, transaction {xid} aborted")]
    ConcurrentUpdate { xid: Xid },

    // === Logical ===
    #[error("no entry at uid {uid}")]
    NullEntry { uid: Uid },

    #[error("record not found: uid {uid}")]
    RecordNotFound { uid: Uid },

    #[error("no active transaction {xid}")]
    NoTransaction { xid: Xid },

    #[error("failpoint triggered: {name}")]
    Injected { name: String },
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Deadlock { xid, .. } => Error::ConcurrentUpdate { xid },
        }
    }
}

impl Error {
    /// True for conditions a caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CacheFull | Error::DatabaseBusy | Error::ConcurrentUpdate { .. }
        )
    }
}
