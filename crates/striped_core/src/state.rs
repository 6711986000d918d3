//! Executor lifecycle state.
//!
//! The lifecycle only moves forward:
//! `Running -> ShuttingDown -> Terminated`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a striped executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExecutorState {
    /// Accepting submissions
    Running,
    /// No new submissions; queued work is draining
    ShuttingDown,
    /// Drained and the worker pool has stopped
    Terminated,
}

impl ExecutorState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::ShuttingDown => 1,
            Self::Terminated => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }

    /// Whether submissions are accepted in this state
    #[must_use]
    pub const fn accepts_work(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Atomic cell holding an [`ExecutorState`].
///
/// All accesses are `SeqCst`: the shutdown path pairs a state write with a
/// read of the stripe registry, and the queue removal path does the reverse.
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    /// Create a cell in the given state
    #[must_use]
    pub const fn new(state: ExecutorState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    /// Load the current state
    #[must_use]
    pub fn load(&self) -> ExecutorState {
        ExecutorState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to` if the cell still holds `from`.
    ///
    /// Returns `true` if this call performed the transition. Backward moves
    /// are refused.
    pub fn transition(&self, from: ExecutorState, to: ExecutorState) -> bool {
        if to <= from {
            return false;
        }
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Advance to at least `to`, never moving backward.
    ///
    /// Returns the state observed before the call.
    pub fn advance_to(&self, to: ExecutorState) -> ExecutorState {
        ExecutorState::from_u8(self.0.fetch_max(to.as_u8(), Ordering::SeqCst))
    }
}

impl Default for AtomicState {
    fn default() -> Self {
        Self::new(ExecutorState::Running)
    }
}
