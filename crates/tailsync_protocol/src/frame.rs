//! Frame header layout and limits.
//!
//! ```text
//! +--------+---------+------+-----------+-----------------+
//! | "TSYN" | version | kind | length    | payload         |
//! | 4      | u16 BE  | u8   | u32 BE    | length bytes    |
//! +--------+---------+------+-----------+-----------------+
//! ```

use crate::error::{ProtocolError, ProtocolResult};

/// Frame magic.
pub const MAGIC: &[u8; 4] = b"TSYN";

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 11;

/// Maximum frame payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of DATA frames produced by senders. Receivers accept anything up to
/// [`MAX_FRAME_SIZE`].
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A CBOR-encoded [`crate::Request`] or [`crate::Response`].
    Control = 1,
    /// Raw file bytes.
    Data = 2,
    /// Terminates a run of DATA frames. Empty payload.
    End = 3,
}

impl FrameKind {
    /// Returns a short name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Control => "CONTROL",
            FrameKind::Data => "DATA",
            FrameKind::End => "END",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> ProtocolResult<Self> {
        match value {
            1 => Ok(FrameKind::Control),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::End),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame kind.
    pub kind: FrameKind,
    /// Payload length in bytes.
    pub len: usize,
}

impl FrameHeader {
    /// Creates a header, checking the payload limit.
    pub fn new(kind: FrameKind, len: usize) -> ProtocolResult<Self> {
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Self { kind, len })
    }

    /// Encodes the header.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(MAGIC);
        out[4..6].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out[6] = self.kind as u8;
        out[7..11].copy_from_slice(&(self.len as u32).to_be_bytes());
        out
    }

    /// Decodes and validates a header.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> ProtocolResult<Self> {
        let magic: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if &magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }

        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: version,
            });
        }

        let kind = FrameKind::try_from(bytes[6])?;
        let len = u32::from_be_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]) as usize;

        Self::new(kind, len)
    }
}

/// Builds a complete frame (header followed by payload).
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
    let header = FrameHeader::new(kind, payload.len())?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    Ok(frame)
}
