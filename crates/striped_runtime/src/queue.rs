//! Per-stripe FIFO sequencer.
//!
//! A [`StripeQueue`] holds the pending work of exactly one stripe and keeps at
//! most one of its jobs on the worker pool at a time. Only the first job ever
//! appended arms the queue; after that every job's completion hands the next
//! job to the pool, or, when nothing is left, deactivates the queue and removes
//! it from the registry.
//!
//! Two sections of the `active` lock must never interleave:
//! - append (shared): submitters check `active` and push to the tail.
//! - drain (exclusive): the driver re-checks for pending work and, only if
//!   there is none, flips `active` to `false` and deregisters.
//!
//! The exclusive section is the only place `active` goes from `true` to
//! `false`, apart from [`close`](StripeQueue::close) and the pool rejection
//! path. Jobs are popped under the lock but handed to the pool after it is
//! released, so no lock is held while a job runs, even on a pool that runs
//! jobs on the calling thread.

use crate::pool::PoolRejection;
use crate::registry::StripeKey;
use crate::task::Job;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{trace, warn};

/// What a stripe queue needs from the executor that owns it
pub(crate) trait QueueOwner<K>: Send + Sync {
    /// Hand a job to the worker pool
    fn dispatch(&self, job: Job) -> Result<(), PoolRejection>;

    /// Called once the queue has deactivated; removes it from the registry
    fn release(&self, queue: &Arc<StripeQueue<K>>);
}

pub(crate) struct StripeQueue<K> {
    key: K,
    pending: Mutex<VecDeque<Job>>,
    active: RwLock<bool>,
    started: AtomicBool,
    /// Jobs popped under `active` whose dispatch call has not returned yet
    handing_off: AtomicUsize,
    owner: Arc<dyn QueueOwner<K>>,
}

impl<K: StripeKey> StripeQueue<K> {
    pub(crate) fn new(key: K, owner: Arc<dyn QueueOwner<K>>) -> Self {
        Self {
            key,
            pending: Mutex::new(VecDeque::new()),
            active: RwLock::new(true),
            started: AtomicBool::new(false),
            handing_off: AtomicUsize::new(0),
            owner,
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// Jobs waiting behind the one in flight
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        *self.active.read()
    }

    /// Append a job, arming the queue if this is its first job.
    ///
    /// Hands the job back if the queue has already deactivated; the caller
    /// retries against a fresh queue from the registry.
    pub(crate) fn try_enqueue(self: &Arc<Self>, job: Job) -> Result<(), Job> {
        {
            let active = self.active.read();
            if !*active {
                return Err(job);
            }
            self.pending.lock().push_back(job);
        }
        if !self.started.swap(true, Ordering::AcqRel) {
            trace!(key = ?self.key, "stripe armed");
            self.schedule_next();
        }
        Ok(())
    }

    /// Move the stripe forward by one job.
    ///
    /// Runs once when the queue is armed and once after every job finishes.
    pub(crate) fn schedule_next(self: &Arc<Self>) {
        let next = {
            let active = self.active.read();
            if !*active {
                return;
            }
            self.take_next()
        };

        match next {
            Some((job, handing_off)) => self.hand_off(job, handing_off),
            None => self.drain_or_deactivate(),
        }
    }

    fn drain_or_deactivate(self: &Arc<Self>) {
        let next = {
            let mut active = self.active.write();
            if !*active {
                return;
            }
            // An append may have landed between the optimistic pop and here.
            let next = self.take_next();
            if next.is_none() {
                *active = false;
            }
            next
        };

        match next {
            Some((job, handing_off)) => self.hand_off(job, handing_off),
            None => {
                trace!(key = ?self.key, "stripe drained");
                self.owner.release(self);
            }
        }
    }

    /// Pop the head job. Must be called under the `active` lock so that
    /// [`close`](Self::close) observes the hand-off.
    fn take_next(&self) -> Option<(Job, HandingOff<'_>)> {
        let job = self.pending.lock().pop_front()?;
        self.handing_off.fetch_add(1, Ordering::SeqCst);
        Some((job, HandingOff(&self.handing_off)))
    }

    /// Give `job` to the pool. No lock is held: the pool may run the job on
    /// this thread before `dispatch` returns.
    fn hand_off(self: &Arc<Self>, job: Job, handing_off: HandingOff<'_>) {
        let queue = Arc::clone(self);
        let task_id = job.task_id();
        let step = Job::with_id(task_id, move || {
            let _advance = Advance(queue);
            job.run();
        });
        let dispatched = self.owner.dispatch(step);
        drop(handing_off);
        match dispatched {
            Ok(()) => trace!(key = ?self.key, %task_id, "stripe job dispatched"),
            Err(rejection) => self.abandon(rejection),
        }
    }

    /// The pool refused our job: drop it and everything behind it, then leave.
    fn abandon(self: &Arc<Self>, rejection: PoolRejection) {
        warn!(
            key = ?self.key,
            task_id = %rejection.task_id(),
            "worker pool refused stripe work, discarding the rest of the stripe"
        );
        drop(rejection);
        let leftovers = {
            let mut active = self.active.write();
            *active = false;
            std::mem::take(&mut *self.pending.lock())
        };
        drop(leftovers);
        self.owner.release(self);
    }

    /// Deactivate and take every job that has not been handed to the pool.
    ///
    /// A job popped before the close may still be on its way to the pool;
    /// [`await_hand_off`](Self::await_hand_off) waits for it to get there.
    pub(crate) fn close(&self) -> Vec<Job> {
        let mut active = self.active.write();
        *active = false;
        self.pending.lock().drain(..).collect()
    }

    /// Wait until no popped job is still between the queue and the pool.
    ///
    /// With a pool that runs jobs on the submitting thread this waits for the
    /// job itself, so it must not be called from inside one of this stripe's
    /// jobs.
    pub(crate) fn await_hand_off(&self) {
        spin_until(|| self.handing_off.load(Ordering::SeqCst) == 0);
    }

    #[cfg(test)]
    pub(crate) fn handing_off(&self) -> usize {
        self.handing_off.load(Ordering::SeqCst)
    }
}

impl<K: std::fmt::Debug> std::fmt::Debug for StripeQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeQueue")
            .field("key", &self.key)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

/// Busy-wait until `done` holds, yielding after a short spin
pub(crate) fn spin_until(mut done: impl FnMut() -> bool) {
    let mut spins = 0u32;
    while !done() {
        if spins < 64 {
            std::hint::spin_loop();
            spins += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

/// Counts a popped job until its dispatch call returns or unwinds.
struct HandingOff<'a>(&'a AtomicUsize);

impl Drop for HandingOff<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Advances the stripe when the running job finishes, even if it unwinds.
struct Advance<K: StripeKey>(Arc<StripeQueue<K>>);

impl<K: StripeKey> Drop for Advance<K> {
    fn drop(&mut self) {
        self.0.schedule_next();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Owner that parks dispatched jobs so a test can run them one at a time
    #[derive(Default)]
    pub(crate) struct ManualOwner {
        pub(crate) dispatched: Mutex<VecDeque<Job>>,
        pub(crate) released: Mutex<usize>,
        pub(crate) refuse: AtomicBool,
    }

    impl ManualOwner {
        pub(crate) fn run_next(&self) -> bool {
            let job = self.dispatched.lock().pop_front();
            match job {
                Some(job) => {
                    job.run();
                    true
                }
                None => false,
            }
        }

        pub(crate) fn in_flight(&self) -> usize {
            self.dispatched.lock().len()
        }

        pub(crate) fn released(&self) -> usize {
            *self.released.lock()
        }
    }

    impl<K> QueueOwner<K> for ManualOwner {
        fn dispatch(&self, job: Job) -> Result<(), PoolRejection> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(PoolRejection::new(job));
            }
            self.dispatched.lock().push_back(job);
            Ok(())
        }

        fn release(&self, _queue: &Arc<StripeQueue<K>>) {
            *self.released.lock() += 1;
        }
    }

    /// Owner that runs every dispatched job before `dispatch` returns
    #[derive(Default)]
    pub(crate) struct InlineOwner {
        pub(crate) released: Mutex<usize>,
    }

    impl<K> QueueOwner<K> for InlineOwner {
        fn dispatch(&self, job: Job) -> Result<(), PoolRejection> {
            job.run();
            Ok(())
        }

        fn release(&self, _queue: &Arc<StripeQueue<K>>) {
            *self.released.lock() += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{InlineOwner, ManualOwner};
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use striped_core::TaskId;

    fn recording_job(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> Job {
        let log = Arc::clone(log);
        Job::new(move || log.lock().push(value))
    }

    fn queue_with(owner: &Arc<ManualOwner>) -> Arc<StripeQueue<&'static str>> {
        let owner: Arc<dyn QueueOwner<&'static str>> = Arc::clone(owner) as _;
        Arc::new(StripeQueue::new("peer-1", owner))
    }

    #[test]
    fn test_first_enqueue_arms_queue() {
        let owner = Arc::new(ManualOwner::default());
        let queue = queue_with(&owner);
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.try_enqueue(recording_job(&log, 1)).unwrap();
        assert_eq!(owner.in_flight(), 1);
        assert_eq!(queue.pending_len(), 0);

        // Later appends wait behind the in-flight job
        queue.try_enqueue(recording_job(&log, 2)).unwrap();
        queue.try_enqueue(recording_job(&log, 3)).unwrap();
        assert_eq!(owner.in_flight(), 1);
        assert_eq!(queue.pending_len(), 2);
    }

    #[test]
    fn test_jobs_run_one_at_a_time_in_order() {
        let owner = Arc::new(ManualOwner::default());
        let queue = queue_with(&owner);
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            queue.try_enqueue(recording_job(&log, i)).unwrap();
        }
        while owner.run_next() {
            assert!(owner.in_flight() <= 1);
        }

        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert!(!queue.is_active());
        assert_eq!(owner.released(), 1);
    }

    #[test]
    fn test_drained_queue_refuses_appends() {
        let owner = Arc::new(ManualOwner::default());
        let queue = queue_with(&owner);
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.try_enqueue(recording_job(&log, 1)).unwrap();
        owner.run_next();
        assert!(!queue.is_active());

        let refused = queue.try_enqueue(recording_job(&log, 2));
        assert!(refused.is_err());
        assert_eq!(owner.in_flight(), 0);
    }

    #[test]
    fn test_append_during_run_is_picked_up() {
        let owner = Arc::new(ManualOwner::default());
        let queue = queue_with(&owner);
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.try_enqueue(recording_job(&log, 1)).unwrap();
        let job = owner.dispatched.lock().pop_front().unwrap();
        // Appended while job 1 is "running"
        queue.try_enqueue(recording_job(&log, 2)).unwrap();
        job.run();

        assert_eq!(owner.in_flight(), 1);
        assert!(queue.is_active());
        owner.run_next();
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(owner.released(), 1);
    }

    #[test]
    fn test_panicking_job_still_advances() {
        let owner = Arc::new(ManualOwner::default());
        let queue = queue_with(&owner);
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.try_enqueue(Job::new(|| panic!("handshake failed"))).unwrap();
        queue.try_enqueue(recording_job(&log, 2)).unwrap();

        let job = owner.dispatched.lock().pop_front().unwrap();
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job.run()));
        assert!(unwound.is_err());

        assert_eq!(owner.in_flight(), 1);
        owner.run_next();
        assert_eq!(*log.lock(), vec![2]);
    }

    #[test]
    fn test_close_returns_pending() {
        let owner = Arc::new(ManualOwner::default());
        let queue = queue_with(&owner);
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = recording_job(&log, 1);
        let second = recording_job(&log, 2);
        let third = recording_job(&log, 3);
        let expected = vec![second.task_id(), third.task_id()];

        queue.try_enqueue(first).unwrap();
        queue.try_enqueue(second).unwrap();
        queue.try_enqueue(third).unwrap();

        let closed: Vec<_> = queue.close().iter().map(Job::task_id).collect();
        assert_eq!(closed, expected);
        assert!(!queue.is_active());

        // The in-flight job finishes without scheduling anything else
        owner.run_next();
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(owner.in_flight(), 0);
        assert_eq!(owner.released(), 0);
    }

    #[test]
    fn test_refused_dispatch_abandons_stripe() {
        let owner = Arc::new(ManualOwner::default());
        let queue = queue_with(&owner);
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.try_enqueue(recording_job(&log, 1)).unwrap();
        queue.try_enqueue(recording_job(&log, 2)).unwrap();
        owner.refuse.store(true, Ordering::SeqCst);
        owner.run_next();

        assert_eq!(*log.lock(), vec![1]);
        assert!(!queue.is_active());
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(owner.released(), 1);
    }

    #[test]
    fn test_inline_dispatch_runs_without_holding_lock() {
        let owner = Arc::new(InlineOwner::default());
        let queue: Arc<StripeQueue<&'static str>> =
            Arc::new(StripeQueue::new("peer-1", Arc::clone(&owner) as _));
        let log = Arc::new(Mutex::new(Vec::new()));

        // Each job runs inside dispatch, and the first one appends to its own
        // stripe while running.
        let second = recording_job(&log, 2);
        let first = {
            let log = Arc::clone(&log);
            let queue = Arc::clone(&queue);
            Job::new(move || {
                log.lock().push(1);
                queue.try_enqueue(second).unwrap();
            })
        };
        let (tx, rx) = mpsc::channel();
        {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                queue.try_enqueue(first).unwrap();
                tx.send(()).unwrap();
            });
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(queue.handing_off(), 0);
        assert!(!queue.is_active());
        assert_eq!(*owner.released.lock(), 1);
    }

    /// Owner whose dispatch blocks until the test lets it through
    struct GatedOwner {
        entered: Mutex<Option<mpsc::Sender<()>>>,
        proceed: Mutex<mpsc::Receiver<()>>,
        accepted: Mutex<Vec<Job>>,
    }

    impl QueueOwner<&'static str> for GatedOwner {
        fn dispatch(&self, job: Job) -> Result<(), PoolRejection> {
            if let Some(entered) = self.entered.lock().take() {
                entered.send(()).unwrap();
            }
            self.proceed.lock().recv().unwrap();
            self.accepted.lock().push(job);
            Ok(())
        }

        fn release(&self, _queue: &Arc<StripeQueue<&'static str>>) {}
    }

    #[test]
    fn test_close_sees_job_in_hand_off() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let owner = Arc::new(GatedOwner {
            entered: Mutex::new(Some(entered_tx)),
            proceed: Mutex::new(proceed_rx),
            accepted: Mutex::new(Vec::new()),
        });
        let queue: Arc<StripeQueue<&'static str>> =
            Arc::new(StripeQueue::new("peer-1", Arc::clone(&owner) as _));
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = recording_job(&log, 1);
        let first_id = first.task_id();

        let submitter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.try_enqueue(first).is_ok())
        };
        entered_rx.recv().unwrap();

        // Popped but not yet with the pool: not pending, still counted.
        assert!(queue.close().is_empty());
        assert_eq!(queue.handing_off(), 1);

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.await_hand_off())
        };
        proceed_tx.send(()).unwrap();
        waiter.join().unwrap();
        assert!(submitter.join().unwrap());

        assert_eq!(queue.handing_off(), 0);
        let accepted: Vec<TaskId> = owner.accepted.lock().iter().map(Job::task_id).collect();
        assert_eq!(accepted, vec![first_id]);
    }
}
