//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to truncate to a size larger than the current one.
    #[error("cannot truncate to {requested} bytes, storage holds only {size}")]
    TruncatePastEnd {
        /// The requested size.
        requested: u64,
        /// The current storage size.
        size: u64,
    },

    /// A watermark record exists but does not hold a non-negative integer.
    #[error("corrupt watermark record {path:?}: {content:?} is not a byte offset")]
    CorruptRecord {
        /// Path of the record.
        path: PathBuf,
        /// The offending content (lossy UTF-8).
        content: String,
    },

    /// Another process owns the watermark record.
    #[error("watermark record {0:?} is locked by another process")]
    Locked(PathBuf),
}

impl StorageError {
    /// Returns true if the error means the persisted record is unusable.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StorageError::CorruptRecord { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_record_display() {
        let err = StorageError::CorruptRecord {
            path: PathBuf::from("offset.txt"),
            content: "abc".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("offset.txt"));
        assert!(msg.contains("abc"));
        assert!(err.is_corrupt());
    }

    #[test]
    fn io_is_not_corrupt() {
        let err = StorageError::from(io::Error::new(io::ErrorKind::Other, "disk gone"));
        assert!(!err.is_corrupt());
    }
}
