//! Error types for the sync engine.

use std::fmt;
use std::io;
use std::path::PathBuf;
use tailsync_protocol::{ErrorCode, ProtocolError};
use tailsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// The step that failed, named in every diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Opening the connection to the remote endpoint.
    Connect,
    /// Logging in to the remote endpoint.
    Authenticate,
    /// Asking the remote endpoint for a file size.
    Size,
    /// Appending bytes to the remote file.
    Append,
    /// Streaming the remote file.
    Retrieve,
    /// Ending the remote session.
    Close,
    /// Reading the persisted watermark.
    ReadWatermark,
    /// Persisting a new watermark.
    CommitWatermark,
    /// Measuring the local source file.
    Measure,
    /// Copying a delta out of the local source file.
    Extract,
    /// Appending received bytes to the local destination file.
    LocalAppend,
    /// Reconciling the local destination with its watermark.
    Reconcile,
    /// Writing a heartbeat line into the local source file.
    Heartbeat,
}

impl Operation {
    /// Returns the operation name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Authenticate => "authenticate",
            Operation::Size => "remote size probe",
            Operation::Append => "remote append",
            Operation::Retrieve => "remote retrieve",
            Operation::Close => "close",
            Operation::ReadWatermark => "watermark read",
            Operation::CommitWatermark => "watermark commit",
            Operation::Measure => "measure source",
            Operation::Extract => "extract delta",
            Operation::LocalAppend => "local append",
            Operation::Reconcile => "reconcile destination",
            Operation::Heartbeat => "heartbeat write",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during sync operations.
///
/// None of these are recovered from inside a running loop. The process
/// either exits or, under a [`crate::Supervisor`], rebuilds the whole loop.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Cannot reach, or log in to, the remote endpoint.
    #[error("{operation} failed: cannot reach remote endpoint: {message}")]
    Connectivity {
        /// Failed operation.
        operation: Operation,
        /// Error message.
        message: String,
    },

    /// A local file could not be opened, read, written or synced.
    #[error("{operation} failed: {source}")]
    LocalIo {
        /// Failed operation.
        operation: Operation,
        /// Underlying storage error.
        #[source]
        source: StorageError,
    },

    /// The remote endpoint rejected an append, size probe or retrieval.
    #[error("{operation} rejected by remote: {message}")]
    RemoteOperation {
        /// Failed operation.
        operation: Operation,
        /// Error message.
        message: String,
        /// Whether the same request could succeed later.
        transient: bool,
    },

    /// The watermark record exists but is not a byte offset.
    #[error("corrupt watermark record {path:?}: {content:?}")]
    CorruptRecord {
        /// Path of the record.
        path: PathBuf,
        /// Offending content.
        content: String,
    },

    /// The watermark points past the end of the local file.
    #[error("watermark {watermark} is ahead of local file size {size}")]
    WatermarkAhead {
        /// Persisted watermark.
        watermark: u64,
        /// Observed file size.
        size: u64,
    },

    /// Malformed or out-of-sequence wire traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An operation exceeded its deadline.
    #[error("{operation} timed out")]
    Timeout {
        /// Failed operation.
        operation: Operation,
    },

    /// The loop was asked to stop.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Wraps a local storage error, surfacing corrupt watermark records as
    /// [`SyncError::CorruptRecord`].
    pub fn local(operation: Operation, source: StorageError) -> Self {
        match source {
            StorageError::CorruptRecord { path, content } => {
                SyncError::CorruptRecord { path, content }
            }
            source => SyncError::LocalIo { operation, source },
        }
    }

    /// Creates a remote failure that may clear on a later attempt.
    pub fn remote(operation: Operation, message: impl Into<String>) -> Self {
        SyncError::RemoteOperation {
            operation,
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a remote rejection from a wire error code.
    ///
    /// Only server-side I/O failures are transient; a missing file, a bad
    /// path or a refused login gets the same answer every time.
    pub fn rejected(operation: Operation, code: ErrorCode, message: impl Into<String>) -> Self {
        SyncError::RemoteOperation {
            operation,
            message: format!("{code:?}: {}", message.into()),
            transient: matches!(code, ErrorCode::Io),
        }
    }

    /// Creates a connectivity error.
    pub fn connectivity(operation: Operation, message: impl Into<String>) -> Self {
        SyncError::Connectivity {
            operation,
            message: message.into(),
        }
    }

    /// Classifies an I/O error raised while talking to the remote endpoint.
    pub fn transport(operation: Operation, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => SyncError::Timeout { operation },
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => SyncError::connectivity(operation, err.to_string()),
            _ => SyncError::remote(operation, err.to_string()),
        }
    }

    /// Returns the failed operation, if the error names one.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            SyncError::Connectivity { operation, .. }
            | SyncError::LocalIo { operation, .. }
            | SyncError::RemoteOperation { operation, .. }
            | SyncError::Timeout { operation } => Some(*operation),
            SyncError::CorruptRecord { .. } => Some(Operation::ReadWatermark),
            _ => None,
        }
    }

    /// Returns true if rebuilding the loop could get past this error.
    ///
    /// Local state problems and wire desync never qualify: retrying cannot
    /// fix a corrupt record, a truncated source or a peer speaking another
    /// protocol.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connectivity { .. }
                | SyncError::RemoteOperation {
                    transient: true,
                    ..
                }
                | SyncError::Timeout { .. }
        )
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::connectivity(Operation::Connect, "refused").is_retryable());
        assert!(SyncError::Timeout {
            operation: Operation::Size
        }
        .is_retryable());
        assert!(SyncError::remote(Operation::Append, "disk full").is_retryable());
        assert!(SyncError::rejected(Operation::Append, ErrorCode::Io, "disk full").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Protocol("bad magic".into()).is_retryable());
        assert!(!SyncError::WatermarkAhead {
            watermark: 10,
            size: 5
        }
        .is_retryable());
    }

    #[test]
    fn permanent_rejections_are_fatal() {
        for code in [
            ErrorCode::NotFound,
            ErrorCode::InvalidPath,
            ErrorCode::Unauthorized,
            ErrorCode::Protocol,
        ] {
            let err = SyncError::rejected(Operation::Append, code, "no");
            assert!(!err.is_retryable(), "{code:?} should not be retried");
        }
        let err = SyncError::rejected(Operation::Retrieve, ErrorCode::InvalidPath, "../x");
        assert_eq!(
            err.to_string(),
            "remote retrieve rejected by remote: InvalidPath: ../x"
        );
    }

    #[test]
    fn corrupt_storage_error_is_surfaced() {
        let err = SyncError::local(
            Operation::ReadWatermark,
            StorageError::CorruptRecord {
                path: PathBuf::from("offset.txt"),
                content: "abc".into(),
            },
        );
        assert!(matches!(err, SyncError::CorruptRecord { .. }));
        assert!(!err.is_retryable());
        assert_eq!(err.operation(), Some(Operation::ReadWatermark));
    }

    #[test]
    fn transport_classification() {
        let err = SyncError::transport(
            Operation::Retrieve,
            io::Error::new(io::ErrorKind::TimedOut, "slow"),
        );
        assert!(matches!(err, SyncError::Timeout { .. }));

        let err = SyncError::transport(
            Operation::Append,
            io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        );
        assert!(matches!(err, SyncError::Connectivity { .. }));
    }

    #[test]
    fn error_display_names_operation() {
        let err = SyncError::remote(Operation::Append, "permission denied");
        assert_eq!(
            err.to_string(),
            "remote append rejected by remote: permission denied"
        );

        let err = SyncError::local(
            Operation::Measure,
            StorageError::Io(io::Error::new(io::ErrorKind::NotFound, "gone")),
        );
        assert!(err.to_string().starts_with("measure source failed"));
    }
}
