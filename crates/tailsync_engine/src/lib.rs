//! # tailsync engine
//!
//! Incremental one-way sync of an append-only file through a remote store.
//!
//! This crate provides:
//! - The producer loop (local file → remote file)
//! - The consumer loop (remote file → local file)
//! - The remote endpoint abstraction, with a TCP client and an in-memory store
//! - A fixed-interval, cancellable scheduler
//! - An opt-in supervisor that rebuilds a failed loop with backoff
//!
//! ## Architecture
//!
//! Each side keeps a **watermark**: how many bytes of the file it has
//! already moved. A cycle moves exactly the bytes past the watermark and
//! then persists the new one.
//!
//! ```text
//! producer:  MEASURE -> EXTRACT -> TRANSFER -> COMMIT
//! consumer:  PROBE -> DECIDE -> FETCH -> APPEND -> COMMIT
//! ```
//!
//! ## Key Invariants
//!
//! - A watermark never exceeds its local file length
//! - A watermark never decreases
//! - A watermark is persisted only after the bytes it covers are durable
//!   on the other side
//! - Delivery is at-least-once; a crash between transfer and commit
//!   duplicates at most one delta
//! - Cycles never overlap; any error ends the loop

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod consumer;
mod delta;
mod error;
mod heartbeat;
mod producer;
mod scheduler;
mod state;
mod supervisor;
mod tcp;
mod transport;

pub use config::{
    ConsumerConfig, Credentials, ProducerConfig, RemoteConfig, RetryConfig, Staging,
    DEFAULT_CHUNK_SIZE, DEFAULT_POLL_INTERVAL,
};
pub use consumer::Consumer;
pub use delta::{advance, needs_fetch, skip_prefix, Delta};
pub use error::{Operation, SyncError, SyncResult};
pub use heartbeat::HeartbeatWriter;
pub use producer::Producer;
pub use scheduler::{RunSummary, Scheduler, StopSignal, SyncLoop};
pub use state::{ConsumerPhase, CycleOutcome, CycleReport, ProducerPhase, SyncStats};
pub use supervisor::Supervisor;
pub use tcp::TcpEndpoint;
pub use transport::{MemoryEndpoint, MemoryRemote, RemoteCalls, RemoteEndpoint};
