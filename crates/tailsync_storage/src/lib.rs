//! # tailsync storage
//!
//! Local storage primitives for tailsync.
//!
//! This crate provides the two pieces of durable state each side of a
//! sync owns:
//!
//! - an **append-only byte store** (the local file being shipped or filled)
//! - a **watermark record** (how many bytes of that file have been moved)
//!
//! ## Design Principles
//!
//! - Byte stores are opaque: they never interpret the data they hold
//! - A watermark record is a plain decimal integer and nothing else
//! - An absent watermark record is a valid state equal to offset 0
//! - A watermark is replaced atomically (write-temp, fsync, rename)
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing; clones share one buffer
//! - [`FileBackend`] - OS file; size is re-read on every call so appends made
//!   by other processes are visible
//!
//! ## Example
//!
//! ```rust
//! use tailsync_storage::{InMemoryBackend, MemoryOffsetStore, OffsetStore, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.append(b"hello").unwrap();
//!
//! let mut offsets = MemoryOffsetStore::new();
//! assert_eq!(offsets.read().unwrap(), 0);
//! offsets.write(backend.size().unwrap()).unwrap();
//! assert_eq!(offsets.read().unwrap(), 5);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod watermark;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use watermark::{parse_watermark, FileOffsetStore, MemoryOffsetStore, OffsetStore};
