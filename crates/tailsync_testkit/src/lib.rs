//! # tailsync testkit
//!
//! Test utilities for tailsync.
//!
//! This crate provides:
//! - In-memory and on-disk rigs wiring a producer and a consumer together
//! - Crash injection for remote endpoints and watermark records
//! - Property-based test generators using proptest
//! - Shared scenario vectors with expected outcomes
//!
//! ## Usage
//!
//! ```rust
//! use tailsync_testkit::prelude::*;
//!
//! let rig = MemoryRig::new("/shared/file1.txt");
//! rig.write_source(b"hello");
//! let mut producer = rig.producer().unwrap();
//! producer.run_cycle().unwrap();
//! assert_eq!(rig.remote_content(), b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::vectors::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use vectors::*;
