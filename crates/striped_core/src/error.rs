//! Error types for the striped executor.

use crate::id::TaskId;

/// Core result type
pub type CoreResult<T> = Result<T, ConfigError>;

/// Submission error, reported synchronously to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The executor is shutting down or terminated; the task was never started
    #[error("Task {task_id} rejected: executor is {state}")]
    Rejected {
        /// Task that was refused
        task_id: TaskId,
        /// Executor state observed at submission
        state: crate::state::ExecutorState,
    },

    /// The worker pool refused an unstriped task (it was shut down externally)
    #[error("Task {task_id} rejected: worker pool is shut down")]
    PoolUnavailable {
        /// Task that was refused
        task_id: TaskId,
    },
}

impl SubmitError {
    /// Task the error belongs to
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        match self {
            Self::Rejected { task_id, .. } | Self::PoolUnavailable { task_id } => *task_id,
        }
    }
}

/// Outcome error delivered through a completion handle.
///
/// A failed task never affects sibling tasks, other stripes, or the executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task panicked while running
    #[error("Task {task_id} failed: {message}")]
    Failed {
        /// Task that failed
        task_id: TaskId,
        /// Panic payload, if it was a string
        message: String,
    },

    /// The task was cancelled or discarded before it started
    #[error("Task {task_id} cancelled")]
    Cancelled {
        /// Task that never ran
        task_id: TaskId,
    },
}

impl TaskError {
    /// Task the error belongs to
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        match self {
            Self::Failed { task_id, .. } | Self::Cancelled { task_id } => *task_id,
        }
    }

    /// Whether the task was cancelled rather than failed
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Worker pool error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool is shut down and refuses new work
    #[error("Worker pool is shut down")]
    Rejected,
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Offending field
        field: String,
        /// Why it was refused
        reason: String,
    },

    /// The configuration document could not be parsed
    #[error("Parse error: {message}")]
    Parse {
        /// Parser message
        message: String,
    },

    /// The configuration file could not be read
    #[error("Cannot read {path}: {message}")]
    Io {
        /// File path
        path: String,
        /// OS error message
        message: String,
    },
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ExecutorState;

    #[test]
    fn test_rejected_display() {
        let task_id = TaskId::from_bytes([0u8; 16]);
        let err = SubmitError::Rejected {
            task_id,
            state: ExecutorState::ShuttingDown,
        };
        let s = err.to_string();
        assert!(s.contains("rejected"));
        assert!(s.contains("SHUTTING_DOWN"));
        assert_eq!(err.task_id(), task_id);
    }

    #[test]
    fn test_pool_unavailable_display() {
        let task_id = TaskId::new();
        let err = SubmitError::PoolUnavailable { task_id };
        assert!(err.to_string().contains("worker pool"));
        assert_eq!(err.task_id(), task_id);
    }

    #[test]
    fn test_task_error_accessors() {
        let task_id = TaskId::new();
        let failed = TaskError::Failed {
            task_id,
            message: "boom".to_string(),
        };
        assert_eq!(failed.task_id(), task_id);
        assert!(!failed.is_cancelled());
        assert!(failed.to_string().contains("boom"));

        let cancelled = TaskError::Cancelled { task_id };
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn test_pool_error_display() {
        assert_eq!(PoolError::Rejected.to_string(), "Worker pool is shut down");
    }

    #[test]
    fn test_config_error_from_json() {
        let err: ConfigError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_error_equality() {
        let task_id = TaskId::new();
        let err1 = TaskError::Cancelled { task_id };
        let err2 = TaskError::Cancelled { task_id };
        assert_eq!(err1, err2);
        assert_ne!(err1, TaskError::Cancelled { task_id: TaskId::new() });
    }
}
