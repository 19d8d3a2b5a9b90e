//! # Riverfork
//!
//! Broadcast one byte stream to several concurrent consumers through bounded
//! buffers, without ever holding the whole stream in memory.
//!
//! A single reader thread pulls chunks from a [`std::io::Read`] source and
//! writes each chunk into every [`branch`]. Each branch is a fixed-capacity
//! buffer with its own consumer on the other end. When any branch is full the
//! reader blocks, so memory stays bounded by the sum of branch capacities and
//! the slowest consumer sets the pace.
//!
//! ## Features
//!
//! - **Bounded branches**: blocking single-writer/single-reader byte buffers
//!   with `std::io::Read`/`Write` on either end
//! - **Orchestration**: consumers on their own threads, driven and joined for you
//! - **Failure propagation**: a consumer that stops early breaks the tee; a
//!   source error reaches every consumer
//! - **Isolation**: optionally detach failed branches and keep feeding the rest
//! - **Deadlines**: cancel a run that takes too long
//! - **Observability**: structured events through `tracing`, `metrics`, or a
//!   sink of your own
//!
//! ## Quick Start
//!
//! ```rust
//! use riverfork::prelude::*;
//! use std::io::{self, Cursor, Read};
//!
//! let orchestrator = Orchestrator::with_config(TeeConfig::upload());
//! let (checksum, length) = orchestrator
//!     .run_pair(
//!         Cursor::new(b"HELLO WORLD".to_vec()),
//!         Consumer::new(|reader| {
//!             let mut sum = 0u32;
//!             for byte in reader.bytes() {
//!                 sum = sum.wrapping_add(byte? as u32);
//!             }
//!             Ok(sum)
//!         }),
//!         Consumer::with_capacity(2, |reader| Ok(io::copy(reader, &mut io::sink())?)),
//!     )
//!     .unwrap();
//!
//! assert_eq!(length, 11);
//! assert_eq!(checksum, b"HELLO WORLD".iter().map(|&b| b as u32).sum::<u32>());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod branch;
pub mod config;
pub mod error;
pub mod observability;
pub mod orchestrator;
pub mod task;
pub mod tee;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::branch::{Branch, BranchReader, BranchStats, BranchWriter};
    pub use crate::config::{FailurePolicy, TeeConfig};
    pub use crate::error::{BoxError, Error, Result};
    pub use crate::orchestrator::{Consumer, Orchestrator, RunReport};
    pub use crate::task::{ConsumerHandle, ConsumerTask, TaskState};
    pub use crate::tee::{DriveSummary, StreamTee};
}

pub use branch::{Branch, BranchReader, BranchStats, BranchWriter};
pub use config::{DEFAULT_CAPACITY, FailurePolicy, TeeConfig};
pub use error::{BoxError, Error, Result};
pub use orchestrator::{Consumer, Orchestrator, RunReport};
pub use task::{ConsumerHandle, ConsumerTask, TaskState};
pub use tee::{DriveSummary, StreamTee};
