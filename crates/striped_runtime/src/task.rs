//! Units of work and their completion handles.
//!
//! A [`Job`] is what a worker pool runs. Jobs built by the executor carry a
//! completer: when the job runs, the closure's return value (or its panic)
//! resolves the paired [`TaskHandle`]. A job dropped without running resolves
//! its handle as cancelled, so every handle is resolved exactly once.

use crate::monitor::ExecutorMetrics;
use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use striped_core::{TaskError, TaskId};

/// A unit of work a task type routes by its own key.
///
/// Returning `None` from [`stripe`](Self::stripe) submits the task unstriped.
pub trait StripedTask<K>: Send + 'static {
    /// Value produced by the task
    type Output: Send + 'static;

    /// The ordering partition this task belongs to
    fn stripe(&self) -> Option<K>;

    /// Do the work
    fn run(self) -> Self::Output;
}

/// Type-erased unit of work accepted by a [`WorkerPool`](crate::pool::WorkerPool)
pub struct Job {
    task_id: TaskId,
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    /// Wrap a closure under a fresh task ID
    pub fn new(work: impl FnOnce() + Send + 'static) -> Self {
        Self::with_id(TaskId::new(), work)
    }

    /// Wrap a closure under an existing task ID
    pub fn with_id(task_id: TaskId, work: impl FnOnce() + Send + 'static) -> Self {
        Self {
            task_id,
            work: Box::new(work),
        }
    }

    /// Build a job whose outcome resolves the returned handle
    pub fn with_handle<F, T>(f: F) -> (Self, TaskHandle<T>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Self::tracked(f, None)
    }

    pub(crate) fn tracked<F, T>(f: F, metrics: Option<Arc<ExecutorMetrics>>) -> (Self, TaskHandle<T>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let task_id = TaskId::new();
        let shared = Arc::new(Completion::new(task_id, metrics));
        let completer = Completer {
            shared: Arc::clone(&shared),
            resolved: false,
        };
        let job = Self::with_id(task_id, move || {
            if !completer.begin() {
                tracing::trace!(%task_id, "skipping cancelled task");
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::warn!(%task_id, %message, "task panicked");
                TaskError::Failed { task_id, message }
            });
            completer.finish(result);
        });
        (job, TaskHandle { task_id, shared })
    }

    /// ID of the task this job runs
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Run the job on the current thread
    pub fn run(self) {
        (self.work)();
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("task_id", &self.task_id).finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

enum Outcome<T> {
    Waiting,
    Ready(Result<T, TaskError>),
    Taken,
}

struct Completion<T> {
    task_id: TaskId,
    phase: AtomicU8,
    outcome: Mutex<Outcome<T>>,
    ready: Condvar,
    waker: AtomicWaker,
    metrics: Option<Arc<ExecutorMetrics>>,
}

impl<T> Completion<T> {
    fn new(task_id: TaskId, metrics: Option<Arc<ExecutorMetrics>>) -> Self {
        Self {
            task_id,
            phase: AtomicU8::new(PENDING),
            outcome: Mutex::new(Outcome::Waiting),
            ready: Condvar::new(),
            waker: AtomicWaker::new(),
            metrics,
        }
    }

    /// First resolution wins; later ones are ignored.
    fn resolve(&self, result: Result<T, TaskError>) -> bool {
        let mut outcome = self.outcome.lock();
        if !matches!(*outcome, Outcome::Waiting) {
            return false;
        }
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(_) => metrics.record_completion(),
                Err(TaskError::Failed { .. }) => metrics.record_failure(),
                Err(TaskError::Cancelled { .. }) => metrics.record_cancellation(),
            }
        }
        *outcome = Outcome::Ready(result);
        drop(outcome);
        self.ready.notify_all();
        self.waker.wake();
        true
    }

    fn is_resolved(&self) -> bool {
        !matches!(*self.outcome.lock(), Outcome::Waiting)
    }
}

struct Completer<T> {
    shared: Arc<Completion<T>>,
    resolved: bool,
}

impl<T> Completer<T> {
    fn begin(&self) -> bool {
        self.shared
            .phase
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(mut self, result: Result<T, TaskError>) {
        self.shared.resolve(result);
        self.resolved = true;
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.resolved {
            let task_id = self.shared.task_id;
            self.shared.resolve(Err(TaskError::Cancelled { task_id }));
        }
    }
}

/// Completion handle for a submitted task.
///
/// Resolved exactly once with the task's return value, its panic as
/// [`TaskError::Failed`], or [`TaskError::Cancelled`] if it never ran. The
/// handle is a `Future`; blocking callers use [`join`](Self::join).
/// Dropping the handle does not cancel the task.
pub struct TaskHandle<T> {
    task_id: TaskId,
    shared: Arc<Completion<T>>,
}

impl<T> TaskHandle<T> {
    /// ID of the submitted task
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Whether the outcome is available
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.is_resolved()
    }

    /// Cancel the task if it has not started.
    ///
    /// A cancelled striped task keeps its place in the stripe; when its turn
    /// comes it is skipped and the stripe moves on. Returns `false` if the task
    /// already started or finished.
    pub fn cancel(&self) -> bool {
        let won = self
            .shared
            .phase
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.shared.resolve(Err(TaskError::Cancelled {
                task_id: self.task_id,
            }));
        }
        won
    }

    /// Block until the task resolves and return its outcome
    pub fn join(self) -> Result<T, TaskError> {
        let mut outcome = self.shared.outcome.lock();
        loop {
            match std::mem::replace(&mut *outcome, Outcome::Taken) {
                Outcome::Ready(result) => return result,
                Outcome::Taken => {
                    return Err(TaskError::Cancelled {
                        task_id: self.task_id,
                    });
                }
                Outcome::Waiting => {
                    *outcome = Outcome::Waiting;
                    self.shared.ready.wait(&mut outcome);
                }
            }
        }
    }

    /// Block for at most `timeout` waiting for the task to resolve.
    ///
    /// Returns `true` if the outcome is available.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.shared.outcome.lock();
        while matches!(*outcome, Outcome::Waiting) {
            if self.shared.ready.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        !matches!(*outcome, Outcome::Waiting)
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.shared.waker.register(cx.waker());
        let mut outcome = this.shared.outcome.lock();
        match std::mem::replace(&mut *outcome, Outcome::Taken) {
            Outcome::Ready(result) => Poll::Ready(result),
            // Polled again after completion; same answer as a second `join`.
            Outcome::Taken => Poll::Ready(Err(TaskError::Cancelled {
                task_id: this.task_id,
            })),
            Outcome::Waiting => {
                *outcome = Outcome::Waiting;
                Poll::Pending
            }
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
