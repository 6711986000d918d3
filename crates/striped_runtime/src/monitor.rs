//! Executor metrics.
//!
//! Lock-free counters updated on the submission and completion paths, read as
//! a point-in-time [`MetricsSnapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by an executor, its stripe queues and its task handles
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    submitted: AtomicU64,
    striped: AtomicU64,
    unstriped: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    queues_created: AtomicU64,
    queues_removed: AtomicU64,
}

impl ExecutorMetrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted submission
    pub fn record_submission(&self, striped: bool) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        if striped {
            self.striped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unstriped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a refused submission
    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task that ran to completion
    pub fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task that panicked
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task that never ran
    pub fn record_cancellation(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stripe queue entering the registry
    pub fn record_queue_created(&self) {
        self.queues_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stripe queue leaving the registry
    pub fn record_queue_removed(&self) {
        self.queues_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Capture the current counter values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            striped: self.striped.load(Ordering::Relaxed),
            unstriped: self.unstriped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            queues_created: self.queues_created.load(Ordering::Relaxed),
            queues_removed: self.queues_removed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ExecutorMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Accepted submissions
    pub submitted: u64,
    /// Accepted submissions that carried a stripe key
    pub striped: u64,
    /// Accepted submissions without a stripe key
    pub unstriped: u64,
    /// Refused submissions
    pub rejected: u64,
    /// Tasks that ran to completion
    pub completed: u64,
    /// Tasks that panicked
    pub failed: u64,
    /// Tasks cancelled or discarded before running
    pub cancelled: u64,
    /// Stripe queues created
    pub queues_created: u64,
    /// Stripe queues removed after draining
    pub queues_removed: u64,
}

impl MetricsSnapshot {
    /// Tasks that have reached a final outcome
    #[must_use]
    pub const fn settled(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }

    /// Stripe queues still registered when the snapshot was taken
    #[must_use]
    pub const fn live_queues(&self) -> u64 {
        self.queues_created.saturating_sub(self.queues_removed)
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let ran = self.completed + self.failed;
        if ran == 0 {
            return 0.0;
        }
        self.failed as f64 / ran as f64
    }
}
