//! Striped Executor Core Types
//!
//! This crate contains pure types and logic with no threads or I/O.
//! The scheduling kernel lives in `striped_runtime`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod id;
pub mod state;

// Re-exports
pub use config::ExecutorConfig;
pub use error::{ConfigError, CoreResult, PoolError, SubmitError, TaskError};
pub use id::TaskId;
pub use state::{AtomicState, ExecutorState};
