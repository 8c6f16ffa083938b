//! Control messages.

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{encode_frame, FrameKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A request from a sync loop to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Opens a session.
    Hello {
        /// Client protocol version.
        protocol_version: u16,
    },
    /// Authenticates the session.
    Authenticate {
        /// User name.
        user: String,
        /// Password.
        password: String,
    },
    /// Asks for the size of a remote file.
    Size {
        /// Remote path.
        path: String,
    },
    /// Starts an append; DATA frames and an END frame follow once the
    /// server answers [`Response::Ready`].
    Append {
        /// Remote path.
        path: String,
    },
    /// Asks for the content of a remote file from `start` to its end.
    Retrieve {
        /// Remote path.
        path: String,
        /// First byte to send. 0 retrieves the whole file.
        start: u64,
    },
    /// Ends the session.
    Quit,
}

impl Request {
    /// Returns the operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Authenticate { .. } => "authenticate",
            Request::Size { .. } => "size",
            Request::Append { .. } => "append",
            Request::Retrieve { .. } => "retrieve",
            Request::Quit => "quit",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }

    /// Encodes as a complete CONTROL frame.
    pub fn to_frame(&self) -> ProtocolResult<Vec<u8>> {
        encode_frame(FrameKind::Control, &self.encode()?)
    }
}

/// Why the server refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The remote file does not exist.
    NotFound,
    /// The session is not authenticated, or credentials were rejected.
    Unauthorized,
    /// The path escapes the served root or is malformed.
    InvalidPath,
    /// The server hit an I/O error.
    Io,
    /// The request was out of sequence or malformed.
    Protocol,
    /// Client and server protocol versions differ.
    VersionMismatch,
}

/// A response from the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Session opened.
    Welcome {
        /// Server protocol version.
        protocol_version: u16,
        /// Session id, for correlating logs.
        session_id: String,
    },
    /// Generic acknowledgement; also "send your DATA frames now" after
    /// [`Request::Append`].
    Ready,
    /// Size of a remote file; `None` when it does not exist.
    Size {
        /// File size in bytes.
        size: Option<u64>,
    },
    /// An append completed.
    Appended {
        /// Bytes appended by this request.
        bytes: u64,
        /// File size after the append.
        size: u64,
    },
    /// DATA frames and an END frame follow.
    Streaming {
        /// File size when the stream was opened.
        size: u64,
    },
    /// Session closed.
    Goodbye,
    /// Request refused.
    Error {
        /// Machine-readable reason.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

impl Response {
    /// Creates an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }

    /// Returns a short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Response::Welcome { .. } => "Welcome",
            Response::Ready => "Ready",
            Response::Size { .. } => "Size",
            Response::Appended { .. } => "Appended",
            Response::Streaming { .. } => "Streaming",
            Response::Goodbye => "Goodbye",
            Response::Error { .. } => "Error",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }

    /// Encodes as a complete CONTROL frame.
    pub fn to_frame(&self) -> ProtocolResult<Vec<u8>> {
        encode_frame(FrameKind::Control, &self.encode()?)
    }
}

fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(out)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, HEADER_LEN};

    #[test]
    fn request_frame_carries_cbor() {
        let request = Request::Size {
            path: "/shared/file1.txt".into(),
        };
        let frame = request.to_frame().unwrap();

        let header: [u8; HEADER_LEN] = frame[..HEADER_LEN].try_into().unwrap();
        let header = FrameHeader::decode(&header).unwrap();
        assert_eq!(header.kind, FrameKind::Control);
        assert_eq!(header.len, frame.len() - HEADER_LEN);

        let decoded = Request::decode(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn error_response() {
        let response = Response::error(ErrorCode::NotFound, "no such file");
        let decoded = Response::decode(&response.encode().unwrap()).unwrap();
        assert!(matches!(
            decoded,
            Response::Error {
                code: ErrorCode::NotFound,
                ..
            }
        ));
        assert_eq!(decoded.name(), "Error");
    }

    #[test]
    fn size_response_distinguishes_missing() {
        let missing = Response::decode(&Response::Size { size: None }.encode().unwrap()).unwrap();
        let empty = Response::decode(&Response::Size { size: Some(0) }.encode().unwrap()).unwrap();
        assert_ne!(missing, empty);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            Request::decode(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::Decode(_))
        ));
    }
}
