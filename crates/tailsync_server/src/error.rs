//! Error types for the remote store.

use tailsync_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the remote store.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The requested path is malformed or escapes the served root.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The requested file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The session may not perform the request.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The peer broke the frame sequence.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer went quiet for longer than allowed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns the wire code reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::InvalidPath(_) => ErrorCode::InvalidPath,
            ServerError::NotFound(_) => ErrorCode::NotFound,
            ServerError::Unauthorized(_) => ErrorCode::Unauthorized,
            ServerError::Protocol(ProtocolError::VersionMismatch { .. }) => {
                ErrorCode::VersionMismatch
            }
            ServerError::Protocol(_) | ServerError::Timeout(_) => ErrorCode::Protocol,
            ServerError::Internal(_) | ServerError::Io(_) => ErrorCode::Io,
        }
    }

    /// Returns true if the client caused the error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidPath(_)
                | ServerError::NotFound(_)
                | ServerError::Unauthorized(_)
                | ServerError::Protocol(_)
                | ServerError::Timeout(_)
        )
    }

    /// Returns true if the server caused the error.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_) | ServerError::Io(_))
    }
}
