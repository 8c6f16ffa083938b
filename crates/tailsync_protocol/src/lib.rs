//! # tailsync protocol
//!
//! Wire protocol between tailsync loops and a remote file store.
//!
//! This crate provides:
//! - The frame header (magic, version, kind, length)
//! - Control messages (`Request` / `Response`) encoded as CBOR
//! - Frame and chunk size limits shared by client and server
//!
//! This is a pure protocol crate with no I/O operations. Clients read and
//! write frames with blocking sockets; the server does so with tokio.
//!
//! ## Flows
//!
//! ```text
//! append:    C: Append{path}        S: Ready
//!            C: DATA* END           S: Appended{bytes, size}
//! retrieve:  C: Retrieve{path, start}
//!            S: Streaming{size} DATA* END
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod frame;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    encode_frame, FrameHeader, FrameKind, DATA_CHUNK_SIZE, HEADER_LEN, MAGIC, MAX_FRAME_SIZE,
    PROTOCOL_VERSION,
};
pub use messages::{ErrorCode, Request, Response};
