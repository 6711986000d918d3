//! Worker pools.
//!
//! The executor never owns threads of its own. It schedules onto any
//! [`WorkerPool`]; [`ThreadPool`] is the fixed-size implementation used when
//! the executor is built from an [`ExecutorConfig`].

use crate::task::Job;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use striped_core::{ConfigError, ExecutorConfig, PoolError, TaskId};
use tracing::{debug, trace, warn};

/// A job the pool refused, handed back to the caller
#[derive(Debug, thiserror::Error)]
#[error("{error}: {task_id} not accepted")]
pub struct PoolRejection {
    task_id: TaskId,
    error: PoolError,
    job: Job,
}

impl PoolRejection {
    /// Wrap a refused job
    #[must_use]
    pub fn new(job: Job) -> Self {
        Self {
            task_id: job.task_id(),
            error: PoolError::Rejected,
            job,
        }
    }

    /// ID of the refused job
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Why the job was refused
    #[must_use]
    pub fn error(&self) -> &PoolError {
        &self.error
    }

    /// Take the refused job back
    #[must_use]
    pub fn into_job(self) -> Job {
        self.job
    }
}

/// Error building a [`ThreadPool`]
#[derive(Debug, thiserror::Error)]
pub enum PoolBuildError {
    /// The configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The OS refused to start a worker thread
    #[error("Failed to spawn worker thread {name}: {message}")]
    Spawn {
        /// Name of the thread that failed to start
        name: String,
        /// OS error message
        message: String,
    },
}

/// Concurrent execution substrate a striped executor schedules onto.
///
/// A pool runs submitted jobs, each at most once, in any order and with any
/// parallelism. A job never runs concurrently with itself.
pub trait WorkerPool: Send + Sync + 'static {
    /// Queue a job for execution.
    ///
    /// # Errors
    ///
    /// Returns the job inside a [`PoolRejection`] if the pool is shut down
    fn execute(&self, job: Job) -> Result<(), PoolRejection>;

    /// Stop accepting jobs; queued jobs still run
    fn shutdown(&self);

    /// Stop accepting jobs and return every queued job that has not started.
    ///
    /// Jobs already running are left to finish.
    fn shutdown_now(&self) -> Vec<Job>;

    /// Whether shutdown has been requested
    fn is_shutdown(&self) -> bool;

    /// Whether the pool is shut down and every worker has exited
    fn is_terminated(&self) -> bool;

    /// Block until terminated or `timeout` elapses; returns `is_terminated()`
    fn await_termination(&self, timeout: Duration) -> bool;
}

struct PoolState {
    backlog: VecDeque<Job>,
    shutdown: bool,
    live_workers: usize,
    busy_workers: usize,
}

impl PoolState {
    fn terminated(&self) -> bool {
        self.shutdown && self.live_workers == 0
    }
}

struct PoolShared {
    name: String,
    state: Mutex<PoolState>,
    job_ready: Condvar,
    all_stopped: Condvar,
}

/// Fixed-size pool of named OS threads sharing one FIFO backlog.
///
/// `shutdown` never blocks, so it is safe to call from one of the pool's own
/// workers. Dropping the pool shuts it down gracefully.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: usize,
}

impl ThreadPool {
    /// Start `workers` threads named `<prefix>-<index>`
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or a thread fails to spawn
    pub fn new(workers: usize, prefix: &str) -> Result<Self, PoolBuildError> {
        Self::from_config(
            &ExecutorConfig::new(workers).with_thread_name_prefix(prefix),
        )
    }

    /// Start a pool sized and named by `config`
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or a thread fails to spawn
    pub fn from_config(config: &ExecutorConfig) -> Result<Self, PoolBuildError> {
        config.validate()?;

        let shared = Arc::new(PoolShared {
            name: config.thread_name_prefix.clone(),
            state: Mutex::new(PoolState {
                backlog: VecDeque::new(),
                shutdown: false,
                live_workers: 0,
                busy_workers: 0,
            }),
            job_ready: Condvar::new(),
            all_stopped: Condvar::new(),
        });
        let pool = Self {
            shared,
            workers: config.workers,
        };

        for index in 0..config.workers {
            let name = format!("{}-{}", config.thread_name_prefix, index);
            pool.shared.state.lock().live_workers += 1;
            let shared = Arc::clone(&pool.shared);
            let spawned = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&shared));
            if let Err(err) = spawned {
                pool.shared.state.lock().live_workers -= 1;
                pool.shutdown();
                return Err(PoolBuildError::Spawn {
                    name,
                    message: err.to_string(),
                });
            }
        }

        debug!(pool = %pool.shared.name, workers = config.workers, "worker pool started");
        Ok(pool)
    }

    /// Number of worker threads the pool was started with
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.workers
    }

    /// Jobs waiting for a free worker
    #[must_use]
    pub fn queued_jobs(&self) -> usize {
        self.shared.state.lock().backlog.len()
    }

    /// Workers currently running a job
    #[must_use]
    pub fn busy_workers(&self) -> usize {
        self.shared.state.lock().busy_workers
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.backlog.pop_front() {
                    state.busy_workers += 1;
                    break Some(job);
                }
                if state.shutdown {
                    break None;
                }
                shared.job_ready.wait(&mut state);
            }
        };
        let Some(job) = job else { break };

        let task_id = job.task_id();
        trace!(%task_id, "worker picked up job");
        if catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
            warn!(%task_id, pool = %shared.name, "job panicked on worker thread");
        }
        shared.state.lock().busy_workers -= 1;
    }

    let mut state = shared.state.lock();
    state.live_workers -= 1;
    if state.live_workers == 0 {
        debug!(pool = %shared.name, "worker pool terminated");
        shared.all_stopped.notify_all();
    }
}

impl WorkerPool for ThreadPool {
    fn execute(&self, job: Job) -> Result<(), PoolRejection> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(PoolRejection::new(job));
        }
        state.backlog.push_back(job);
        drop(state);
        self.shared.job_ready.notify_one();
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if !state.shutdown {
            state.shutdown = true;
            debug!(pool = %self.shared.name, queued = state.backlog.len(), "worker pool shutting down");
        }
        drop(state);
        self.shared.job_ready.notify_all();
    }

    fn shutdown_now(&self) -> Vec<Job> {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        let drained: Vec<Job> = state.backlog.drain(..).collect();
        drop(state);
        self.shared.job_ready.notify_all();
        debug!(pool = %self.shared.name, discarded = drained.len(), "worker pool stopped");
        drained
    }

    fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    fn is_terminated(&self) -> bool {
        self.shared.state.lock().terminated()
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.terminated() {
            if self.shared.all_stopped.wait_until(&mut state, deadline).timed_out() {
                return state.terminated();
            }
        }
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Display for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        write!(
            f,
            "ThreadPool({}: workers={}, busy={}, queued={}, shutdown={})",
            self.shared.name,
            self.workers,
            state.busy_workers,
            state.backlog.len(),
            state.shutdown
        )
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_pool_runs_jobs() {
        let pool = ThreadPool::new(2, "test-pool").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.execute(Job::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_pool_rejects_after_shutdown() {
        let pool = ThreadPool::new(1, "test-pool").unwrap();
        pool.shutdown();
        assert!(pool.is_shutdown());

        let job = Job::new(|| ());
        let task_id = job.task_id();
        let rejection = pool.execute(job).unwrap_err();
        assert_eq!(rejection.task_id(), task_id);
        assert_eq!(rejection.error(), &PoolError::Rejected);
        assert_eq!(rejection.into_job().task_id(), task_id);
    }

    #[test]
    fn test_pool_shutdown_now_returns_backlog() {
        let pool = ThreadPool::new(1, "test-pool").unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        pool.execute(Job::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }))
        .unwrap();
        started_rx.recv().unwrap();

        let queued: Vec<TaskId> = (0..3)
            .map(|_| {
                let job = Job::new(|| ());
                let id = job.task_id();
                pool.execute(job).unwrap();
                id
            })
            .collect();

        let drained = pool.shutdown_now();
        let drained_ids: Vec<TaskId> = drained.iter().map(Job::task_id).collect();
        assert_eq!(drained_ids, queued);
        assert!(!pool.is_terminated());

        release_tx.send(()).unwrap();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_pool_survives_panicking_job() {
        let pool = ThreadPool::new(1, "test-pool").unwrap();
        pool.execute(Job::new(|| panic!("boom"))).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.execute(Job::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_pool_await_termination_times_out() {
        let pool = ThreadPool::new(1, "test-pool").unwrap();
        assert!(!pool.await_termination(Duration::from_millis(20)));
        assert!(!pool.is_terminated());
    }

    #[test]
    fn test_pool_shutdown_from_worker() {
        let pool = Arc::new(ThreadPool::new(2, "test-pool").unwrap());
        let inner = Arc::clone(&pool);
        pool.execute(Job::new(move || inner.shutdown())).unwrap();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_pool_invalid_config() {
        let err = ThreadPool::new(0, "test-pool").unwrap_err();
        assert!(matches!(err, PoolBuildError::Config(_)));
    }

    #[test]
    fn test_pool_display() {
        let pool = ThreadPool::new(3, "shown").unwrap();
        let s = pool.to_string();
        assert!(s.contains("shown"));
        assert!(s.contains("workers=3"));
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.queued_jobs(), 0);
    }
}
