use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset {offset} out of range [{log_start}, {log_end}]")]
    OffsetOutOfRange {
        offset: u64,
        log_start: u64,
        log_end: u64,
    },

    #[error("corrupt segment {path}: {reason}")]
    CorruptSegment { path: PathBuf, reason: String },

    #[error("cannot sync {path} to disk: {source}")]
    SyncFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("journal directory {path} is locked by another process")]
    LockFailed { path: PathBuf },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("segment with base offset {base_offset} is full")]
    SegmentFull { base_offset: u64 },

    #[error("entry of {size} bytes exceeds the maximum record field size")]
    EntryTooLarge { size: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for append failures that a roll to a fresh segment can resolve.
    pub(crate) fn is_segment_full(&self) -> bool {
        matches!(self, Error::SegmentFull { .. })
    }
}
