//! Striped executor runtime
//!
//! Runs tasks on a worker pool while keeping every task that shares a stripe
//! key strictly sequential and in submission order. Tasks on different stripes,
//! and tasks with no stripe, run in parallel.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod executor;
pub mod monitor;
pub mod pool;
mod queue;
pub mod registry;
pub mod task;

pub use executor::StripedExecutor;
pub use monitor::{ExecutorMetrics, MetricsSnapshot};
pub use pool::{PoolBuildError, PoolRejection, ThreadPool, WorkerPool};
pub use registry::StripeKey;
pub use task::{Job, StripedTask, TaskHandle};

pub use striped_core::{ExecutorConfig, ExecutorState, SubmitError, TaskError, TaskId};
