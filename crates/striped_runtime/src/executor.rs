//! Striped executor: the submission façade and shutdown state machine.
//!
//! Work submitted with a stripe key runs strictly one-at-a-time and in
//! submission order relative to other work with an equal key. Work with no key,
//! or with different keys, runs with whatever parallelism the worker pool
//! offers.
//!
//! Lifecycle:
//! - `Running`: submissions accepted.
//! - `ShuttingDown`: submissions rejected; queued striped work drains. When the
//!   last stripe queue leaves the registry and no submission is mid-flight, the
//!   worker pool is shut down.
//! - `Terminated`: the registry is empty and the pool has terminated.

use crate::monitor::{ExecutorMetrics, MetricsSnapshot};
use crate::pool::{PoolBuildError, PoolRejection, ThreadPool, WorkerPool};
use crate::queue::{QueueOwner, StripeQueue, spin_until};
use crate::registry::{StripeKey, StripeRegistry};
use crate::task::{Job, StripedTask, TaskHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use striped_core::{AtomicState, ExecutorConfig, ExecutorState, SubmitError, TaskId};
use tracing::{debug, trace};

struct Inner<K: StripeKey, P: WorkerPool> {
    pool: Arc<P>,
    registry: StripeRegistry<K>,
    state: AtomicState,
    /// Submissions that passed the state check and have not yet been routed
    admitting: AtomicUsize,
    metrics: Arc<ExecutorMetrics>,
}

impl<K: StripeKey, P: WorkerPool> Inner<K, P> {
    /// Shut the pool down once nothing can add stripe work any more.
    ///
    /// Called after the state leaves `Running`, after every queue removal
    /// and after every admission completes, so whichever happens last
    /// triggers the pool shutdown.
    fn try_finish(&self) {
        if self.state.load().accepts_work() {
            return;
        }
        if self.admitting.load(Ordering::SeqCst) == 0 && self.registry.is_empty() {
            if !self.pool.is_shutdown() {
                debug!("stripes drained, shutting down worker pool");
            }
            self.pool.shutdown();
        }
    }

    fn is_terminated(&self) -> bool {
        let state = self.state.load();
        if state == ExecutorState::Terminated {
            return true;
        }
        if state.accepts_work() || !self.registry.is_empty() || !self.pool.is_terminated() {
            return false;
        }
        if self.state.advance_to(ExecutorState::Terminated) != ExecutorState::Terminated {
            debug!("striped executor terminated");
        }
        true
    }
}

impl<K: StripeKey, P: WorkerPool> QueueOwner<K> for Inner<K, P> {
    fn dispatch(&self, job: Job) -> Result<(), PoolRejection> {
        self.pool.execute(job)
    }

    fn release(&self, queue: &Arc<StripeQueue<K>>) {
        if self.registry.remove(queue) {
            self.metrics.record_queue_removed();
            trace!(key = ?queue.key(), "stripe queue removed");
        }
        self.try_finish();
    }
}

/// Marks a submission as in flight between the state check and routing.
struct Admission<'a, K: StripeKey, P: WorkerPool>(&'a Inner<K, P>);

impl<'a, K: StripeKey, P: WorkerPool> Admission<'a, K, P> {
    fn enter(inner: &'a Inner<K, P>) -> Self {
        inner.admitting.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl<K: StripeKey, P: WorkerPool> Drop for Admission<'_, K, P> {
    fn drop(&mut self) {
        self.0.admitting.fetch_sub(1, Ordering::SeqCst);
        self.0.try_finish();
    }
}

/// Key-partitioned task executor.
///
/// Cloning yields another handle to the same executor.
///
/// ```no_run
/// use striped_runtime::StripedExecutor;
///
/// let executor = StripedExecutor::<String>::with_workers(4).unwrap();
/// let handle = executor.submit(Some("peer-1".to_string()), || 2 + 2).unwrap();
/// assert_eq!(handle.join(), Ok(4));
/// executor.shutdown();
/// ```
pub struct StripedExecutor<K: StripeKey, P: WorkerPool = ThreadPool> {
    inner: Arc<Inner<K, P>>,
}

impl<K: StripeKey> StripedExecutor<K, ThreadPool> {
    /// Create an executor over a fresh [`ThreadPool`] built from `config`
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or a worker fails to start
    pub fn with_config(config: &ExecutorConfig) -> Result<Self, PoolBuildError> {
        Ok(Self::new(Arc::new(ThreadPool::from_config(config)?)))
    }

    /// Create an executor over a fresh [`ThreadPool`] of `workers` threads
    ///
    /// # Errors
    ///
    /// Returns error if `workers` is zero or a worker fails to start
    pub fn with_workers(workers: usize) -> Result<Self, PoolBuildError> {
        Self::with_config(&ExecutorConfig::new(workers))
    }
}

impl<K: StripeKey, P: WorkerPool> StripedExecutor<K, P> {
    /// Create an executor that schedules onto `pool`.
    ///
    /// The executor shuts the pool down as part of its own shutdown; the pool
    /// should not be shut down independently while stripes are queued.
    #[must_use]
    pub fn new(pool: Arc<P>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                registry: StripeRegistry::new(),
                state: AtomicState::default(),
                admitting: AtomicUsize::new(0),
                metrics: Arc::new(ExecutorMetrics::new()),
            }),
        }
    }

    /// Submit `task`, ordered behind earlier work with an equal `key`.
    ///
    /// With `key == None` the task goes straight to the worker pool.
    ///
    /// # Errors
    ///
    /// Returns `SubmitError::Rejected` if the executor is not running; the
    /// task is never started
    pub fn submit<F, T>(&self, key: Option<K>, task: F) -> Result<TaskHandle<T>, SubmitError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = Job::tracked(task, Some(Arc::clone(&self.inner.metrics)));
        self.route(key, job)?;
        Ok(handle)
    }

    /// Submit `task` on the stripe `key`
    ///
    /// # Errors
    ///
    /// Returns `SubmitError::Rejected` if the executor is not running
    pub fn submit_striped<F, T>(&self, key: K, task: F) -> Result<TaskHandle<T>, SubmitError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit(Some(key), task)
    }

    /// Submit `task` with no ordering constraint
    ///
    /// # Errors
    ///
    /// Returns `SubmitError::Rejected` if the executor is not running
    pub fn submit_unstriped<F, T>(&self, task: F) -> Result<TaskHandle<T>, SubmitError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit(None, task)
    }

    /// Submit a task that names its own stripe
    ///
    /// # Errors
    ///
    /// Returns `SubmitError::Rejected` if the executor is not running
    pub fn submit_task<S>(&self, task: S) -> Result<TaskHandle<S::Output>, SubmitError>
    where
        S: StripedTask<K>,
    {
        let key = task.stripe();
        self.submit(key, move || task.run())
    }

    /// Fire-and-forget submission; the outcome is only visible in metrics
    ///
    /// # Errors
    ///
    /// Returns `SubmitError::Rejected` if the executor is not running
    pub fn execute<F>(&self, key: Option<K>, task: F) -> Result<TaskId, SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(key, task).map(|handle| handle.task_id())
    }

    fn route(&self, key: Option<K>, job: Job) -> Result<(), SubmitError> {
        let inner = &self.inner;
        let _admission = Admission::enter(inner);

        let state = inner.state.load();
        if !state.accepts_work() {
            inner.metrics.record_rejection();
            return Err(SubmitError::Rejected {
                task_id: job.task_id(),
                state,
            });
        }

        let Some(key) = key else {
            let task_id = job.task_id();
            return match inner.pool.execute(job) {
                Ok(()) => {
                    inner.metrics.record_submission(false);
                    trace!(%task_id, "unstriped task submitted");
                    Ok(())
                }
                Err(rejection) => {
                    inner.metrics.record_rejection();
                    Err(SubmitError::PoolUnavailable {
                        task_id: rejection.task_id(),
                    })
                }
            };
        };

        let owner: Arc<dyn QueueOwner<K>> = Arc::clone(inner) as Arc<dyn QueueOwner<K>>;
        let task_id = job.task_id();
        let mut job = job;
        loop {
            let (queue, created) = inner
                .registry
                .get_or_create(&key, || StripeQueue::new(key.clone(), Arc::clone(&owner)));
            if created {
                inner.metrics.record_queue_created();
                trace!(key = ?key, "stripe queue created");
            }
            match queue.try_enqueue(job) {
                Ok(()) => break,
                Err(returned) => {
                    // The queue drained between lookup and append. Its driver
                    // is about to deregister it; help so the retry finds a
                    // fresh queue.
                    job = returned;
                    if inner.registry.remove(&queue) {
                        inner.metrics.record_queue_removed();
                    }
                }
            }
        }

        inner.metrics.record_submission(true);
        trace!(key = ?key, %task_id, "striped task submitted");
        Ok(())
    }

    /// Stop accepting work and let queued work drain.
    ///
    /// Idempotent. Once every stripe has drained the worker pool is shut down
    /// and the executor terminates; with nothing queued that happens
    /// immediately.
    pub fn shutdown(&self) {
        if self
            .inner
            .state
            .transition(ExecutorState::Running, ExecutorState::ShuttingDown)
        {
            debug!(stripes = self.inner.registry.len(), "striped executor shutting down");
            self.inner.try_finish();
        }
    }

    /// Stop accepting work, stop scheduling queued work, and return every job
    /// that never started.
    ///
    /// Covers the pending jobs of every stripe and the pool's own backlog,
    /// each exactly once. Jobs already running are left to finish. Dropping a
    /// returned job resolves its handle as cancelled; running it completes
    /// the handle normally.
    ///
    /// Waits for submissions already past the state check to finish routing.
    /// With a pool that runs jobs on the submitting thread, that includes the
    /// jobs they run, so this must not be called from inside a task on such a
    /// pool.
    pub fn shutdown_now(&self) -> Vec<Job> {
        let inner = &self.inner;
        inner.state.advance_to(ExecutorState::ShuttingDown);

        // After this no submission can reach the registry or the pool.
        spin_until(|| inner.admitting.load(Ordering::SeqCst) == 0);

        let mut discarded = Vec::new();
        let queues = inner.registry.snapshot();
        for queue in &queues {
            discarded.extend(queue.close());
            if inner.registry.remove(queue) {
                inner.metrics.record_queue_removed();
            }
        }
        // A job popped just before its queue closed must be in the pool
        // backlog before the backlog is drained.
        for queue in &queues {
            queue.await_hand_off();
        }
        discarded.extend(inner.pool.shutdown_now());

        debug!(discarded = discarded.len(), "striped executor stopped");
        inner.try_finish();
        discarded
    }

    /// Whether `shutdown` or `shutdown_now` has been called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        !self.inner.state.load().accepts_work()
    }

    /// Whether shutdown has completed: every stripe drained and the pool
    /// terminated
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }

    /// Block until terminated or `timeout` elapses; returns `is_terminated()`
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.inner.pool.await_termination(remaining) && self.is_terminated() {
                return true;
            }
            if remaining.is_zero() {
                return self.is_terminated();
            }
            // The pool has terminated but the registry has not caught up yet.
            std::thread::sleep(Duration::from_millis(1).min(remaining));
        }
    }

    /// Async form of [`await_termination`](Self::await_termination).
    ///
    /// The wait runs on tokio's blocking pool so the calling runtime keeps
    /// making progress. Must be called from within a tokio runtime.
    pub async fn terminated(&self, timeout: Duration) -> bool {
        let executor = self.clone();
        tokio::task::spawn_blocking(move || executor.await_termination(timeout))
            .await
            .unwrap_or_else(|_| self.is_terminated())
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ExecutorState {
        if self.is_terminated() {
            ExecutorState::Terminated
        } else {
            self.inner.state.load()
        }
    }

    /// Stripes with queued or running work
    #[must_use]
    pub fn active_stripes(&self) -> usize {
        self.inner.registry.len()
    }

    /// Striped jobs waiting behind their stripe's in-flight job
    #[must_use]
    pub fn pending_striped(&self) -> usize {
        self.inner
            .registry
            .snapshot()
            .iter()
            .map(|queue| queue.pending_len())
            .sum()
    }

    /// Counters since creation
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// The worker pool this executor schedules onto
    #[must_use]
    pub fn pool(&self) -> &Arc<P> {
        &self.inner.pool
    }
}

impl<K: StripeKey, P: WorkerPool> Clone for StripedExecutor<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: StripeKey, P: WorkerPool> std::fmt::Display for StripedExecutor<K, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StripedExecutor: state={}, stripes={}, pool_shutdown={}, pool_terminated={}",
            self.state(),
            self.active_stripes(),
            self.inner.pool.is_shutdown(),
            self.inner.pool.is_terminated()
        )
    }
}

impl<K: StripeKey, P: WorkerPool> std::fmt::Debug for StripedExecutor<K, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedExecutor")
            .field("state", &self.state())
            .field("stripes", &self.inner.registry.snapshot())
            .finish_non_exhaustive()
    }
}
