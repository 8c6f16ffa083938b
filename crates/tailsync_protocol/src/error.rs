//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding frames and messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame did not start with the protocol magic.
    #[error("bad frame magic: {0:02x?}")]
    BadMagic([u8; 4]),

    /// Peer speaks a different protocol version.
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Local protocol version.
        local: u16,
        /// Remote protocol version.
        remote: u16,
    },

    /// Frame kind byte is not one we know.
    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u8),

    /// Frame payload exceeds the size limit.
    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Declared payload length.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// A message could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// A message could not be deserialized.
    #[error("decode error: {0}")]
    Decode(String),

    /// A well-formed frame arrived where another was expected.
    #[error("unexpected {found} while waiting for {expected}")]
    Unexpected {
        /// What the reader was waiting for.
        expected: &'static str,
        /// What actually arrived.
        found: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::VersionMismatch {
            local: 1,
            remote: 2,
        };
        assert!(err.to_string().contains("local=1"));
        assert!(err.to_string().contains("remote=2"));

        let err = ProtocolError::BadMagic(*b"HTTP");
        assert!(err.to_string().contains("48"));
    }
}
