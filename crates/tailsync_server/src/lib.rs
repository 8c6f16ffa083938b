//! # tailsync server
//!
//! The remote end of a tailsync pipeline: a small daemon that stores
//! append-only files under a root directory and serves the tailsync wire
//! protocol over TCP.
//!
//! This crate provides:
//! - Size probes, appends and (ranged) retrievals of remote files
//! - Path confinement under the served root
//! - Optional password login (HMAC-SHA256 digests, constant-time checks)
//! - Per-path append serialization
//!
//! # Sessions
//!
//! A client opens with `Hello`, optionally logs in, then issues any number
//! of requests on the same connection. A session ends on `Quit`, on
//! disconnect, on a protocol violation, or after the idle timeout.
//!
//! Request-level failures (missing file, bad path, not logged in) are
//! reported as `Error` responses and leave the session usable.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;
mod store;

pub use auth::CredentialValidator;
pub use config::{ServerConfig, UserEntry};
pub use error::{ServerError, ServerResult};
pub use handler::{serve_connection, HandlerContext, SessionInfo};
pub use server::{BackgroundServer, RemoteStoreServer};
pub use store::FileStore;
