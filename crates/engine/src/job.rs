//! Per-key load jobs and their waiters
//!
//! A job collects every waiter interested in one request key and delivers the
//! single outcome to all of them in attachment order. Outcomes are stored so
//! that a waiter attaching after the job finished is answered immediately.
//!
//! The engine drops a job from its key table before delivering, so later loads
//! of the same key are served by the active set or memory cache, or start a new
//! job. Only jobs that are still pending or running ever receive `attach` there.

use crate::arena::Index;
use crate::engine::Loaded;
use crate::error::LoadError;
use crate::key::RequestKey;
use crate::resource::{DataSource, ResourceId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Retained job allocations
pub(crate) const JOB_POOL_SIZE: usize = 150;

/// Which pools a load may use to obtain its source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoClass {
    /// Only the disk cache; a miss fails the load
    DiskOnly,
    /// The bounded source pool
    #[default]
    Source,
    /// The unbounded hand-off pool
    SourceUnlimited,
}

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Created, not yet scheduled
    Pending,
    /// Scheduled on a pool
    Running,
    /// Produced a resource
    Completed,
    /// Produced an error
    Failed,
    /// Lost every waiter before finishing
    Cancelled,
}

impl JobState {
    /// Returns true for states a job never leaves
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Arena index of a live job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub(crate) Index);

/// Identity of a waiter within its job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WaiterId(u64);

impl WaiterId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) type LoadCallback = Box<dyn FnOnce(Result<Loaded, LoadError>) + Send>;

/// A callback waiting for a job's outcome
pub(crate) struct Waiter {
    id: WaiterId,
    detached: Arc<AtomicBool>,
    callback: LoadCallback,
}

impl Waiter {
    pub(crate) fn new(callback: LoadCallback) -> Self {
        Self {
            id: WaiterId::next(),
            detached: Arc::new(AtomicBool::new(false)),
            callback,
        }
    }

    pub(crate) const fn id(&self) -> WaiterId {
        self.id
    }

    pub(crate) fn detached_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.detached)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn invoke(self, outcome: Result<Loaded, LoadError>) {
        (self.callback)(outcome);
    }
}

/// Stored result of a finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed {
        resource: ResourceId,
        source: DataSource,
    },
    Failed(LoadError),
}

/// Result of attaching a waiter
pub(crate) enum Attach {
    /// Queued for delivery
    Queued,
    /// The job already finished; the caller delivers the stored outcome
    Replay(Waiter, Outcome),
    /// The job was cancelled and will not deliver
    Rejected(Waiter),
}

/// Result of detaching a waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detach {
    /// Removed; other waiters remain
    Removed,
    /// Removed the last waiter and cancelled the job
    Cancelled,
    /// The job already finished; the waiter will be skipped
    Ignored,
    /// The waiter is not attached
    Unknown,
}

pub(crate) struct Job {
    key: RequestKey,
    cacheable: bool,
    io_class: IoClass,
    state: JobState,
    waiters: Vec<Waiter>,
    ignored: Vec<WaiterId>,
    outcome: Option<Outcome>,
    cancelled: Arc<AtomicBool>,
}

impl Job {
    pub(crate) const fn key(&self) -> &RequestKey {
        &self.key
    }

    pub(crate) const fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    #[cfg(test)]
    pub(crate) const fn io_class(&self) -> IoClass {
        self.io_class
    }

    #[cfg(test)]
    pub(crate) const fn state(&self) -> JobState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Flag the worker polls to abandon the job early
    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub(crate) const fn is_cancelled(&self) -> bool {
        matches!(self.state, JobState::Cancelled)
    }

    pub(crate) fn start(&mut self) {
        assert!(
            self.state == JobState::Pending,
            "job for {} started twice",
            self.key
        );
        self.state = JobState::Running;
    }

    pub(crate) fn attach(&mut self, waiter: Waiter) -> Attach {
        match self.state {
            JobState::Pending | JobState::Running => {
                self.waiters.push(waiter);
                Attach::Queued
            }
            JobState::Completed | JobState::Failed => match &self.outcome {
                Some(outcome) => Attach::Replay(waiter, outcome.clone()),
                None => Attach::Rejected(waiter),
            },
            JobState::Cancelled => Attach::Rejected(waiter),
        }
    }

    pub(crate) fn detach(&mut self, id: WaiterId) -> Detach {
        if self.state.is_terminal() {
            if !self.ignored.contains(&id) {
                self.ignored.push(id);
            }
            return Detach::Ignored;
        }
        let Some(position) = self.waiters.iter().position(|w| w.id() == id) else {
            return Detach::Unknown;
        };
        self.waiters.remove(position);
        if self.waiters.is_empty() {
            self.cancel();
            Detach::Cancelled
        } else {
            Detach::Removed
        }
    }

    /// Cancel without delivering; returns false if already finished
    pub(crate) fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = JobState::Cancelled;
        self.cancelled.store(true, Ordering::Release);
        true
    }

    /// Record the outcome and hand back the waiters to notify, in order
    pub(crate) fn complete(&mut self, outcome: Outcome) -> Vec<Waiter> {
        assert!(
            matches!(self.state, JobState::Pending | JobState::Running),
            "job for {} finished twice",
            self.key
        );
        self.state = match outcome {
            Outcome::Completed { .. } => JobState::Completed,
            Outcome::Failed(_) => JobState::Failed,
        };
        self.outcome = Some(outcome);
        let ignored = std::mem::take(&mut self.ignored);
        let waiters = std::mem::take(&mut self.waiters)
            .into_iter()
            .filter(|waiter| !ignored.contains(&waiter.id()) && !waiter.is_detached())
            .collect();
        self.ignored = ignored;
        waiters
    }

    /// Take every waiter without recording an outcome
    pub(crate) fn take_waiters(&mut self) -> Vec<Waiter> {
        std::mem::take(&mut self.waiters)
    }
}

/// Free list of job allocations
///
/// Acquiring always yields a job in its initial state; only the waiter
/// storage is reused.
pub(crate) struct JobPool {
    spare: Vec<(Vec<Waiter>, Vec<WaiterId>)>,
    capacity: usize,
}

impl JobPool {
    pub(crate) const fn new(capacity: usize) -> Self {
        Self {
            spare: Vec::new(),
            capacity,
        }
    }

    pub(crate) fn acquire(&mut self, key: RequestKey, cacheable: bool, io_class: IoClass) -> Job {
        let (waiters, ignored) = self.spare.pop().unwrap_or_default();
        Job {
            key,
            cacheable,
            io_class,
            state: JobState::Pending,
            waiters,
            ignored,
            outcome: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn release(&mut self, job: Job) {
        if self.spare.len() >= self.capacity {
            return;
        }
        let Job {
            mut waiters,
            mut ignored,
            ..
        } = job;
        waiters.clear();
        ignored.clear();
        self.spare.push((waiters, ignored));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.spare.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::key::Model;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<(usize, Result<(), LoadError>)>>>;

    fn key() -> RequestKey {
        RequestKey::builder(Model::Url("https://example.com/cat.jpg".into())).build()
    }

    fn waiter(log: &Log, label: usize) -> Waiter {
        let log = Arc::clone(log);
        Waiter::new(Box::new(move |result| {
            log.lock().unwrap().push((label, result.map(|_| ())));
        }))
    }

    fn failed() -> Outcome {
        Outcome::Failed(LoadError::fetch_failed("cat", "404"))
    }

    fn running_job(pool: &mut JobPool) -> Job {
        let mut job = pool.acquire(key(), true, IoClass::Source);
        job.start();
        job
    }

    // ==========================================================================
    // Delivery
    // ==========================================================================

    #[test]
    fn test_waiters_notified_in_attachment_order() {
        let log = Log::default();
        let mut pool = JobPool::new(JOB_POOL_SIZE);
        let mut job = running_job(&mut pool);
        for label in 0..3 {
            assert!(matches!(job.attach(waiter(&log, label)), Attach::Queued));
        }

        for waiter in job.complete(failed()) {
            waiter.invoke(Err(LoadError::Cancelled));
        }
        let labels: Vec<_> = log.lock().unwrap().iter().map(|(l, _)| *l).collect();
        assert_eq!(labels, vec![0, 1, 2]);
        assert_eq!(job.state(), JobState::Failed);
    }

    #[test]
    fn test_late_waiter_replays_outcome() {
        let log = Log::default();
        let mut pool = JobPool::new(JOB_POOL_SIZE);
        let mut job = running_job(&mut pool);
        let _ = job.attach(waiter(&log, 0));
        let resource = ResourceId(Arena::new().insert(()));
        let outcome = Outcome::Completed {
            resource,
            source: DataSource::Remote,
        };
        assert_eq!(job.complete(outcome.clone()).len(), 1);

        let Attach::Replay(_, replayed) = job.attach(waiter(&log, 1)) else {
            panic!("expected a replay");
        };
        assert_eq!(replayed, outcome);
        assert_eq!(job.waiter_count(), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_late_waiter_replays_failure_exactly_once() {
        let log = Log::default();
        let mut pool = JobPool::new(JOB_POOL_SIZE);
        let mut job = running_job(&mut pool);
        let first = waiter(&log, 0);
        let _ = job.attach(first);
        for waiter in job.complete(failed()) {
            waiter.invoke(Err(LoadError::fetch_failed("cat", "404")));
        }

        let Attach::Replay(late, Outcome::Failed(error)) = job.attach(waiter(&log, 1)) else {
            panic!("expected a failed replay");
        };
        late.invoke(Err(error.clone()));

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.iter().filter(|(label, _)| *label == 1).count(), 1);
        assert_eq!(log[1], (1, Err(error)));
    }

    #[test]
    fn test_cancelled_job_rejects_late_waiter() {
        let log = Log::default();
        let mut pool = JobPool::new(JOB_POOL_SIZE);
        let mut job = running_job(&mut pool);
        assert!(job.cancel());
        assert!(matches!(job.attach(waiter(&log, 0)), Attach::Rejected(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "finished twice")]
    fn test_completing_twice_panics() {
        let mut pool = JobPool::new(JOB_POOL_SIZE);
        let mut job = running_job(&mut pool);
        let _ = job.complete(failed());
        let _ = job.complete(failed());
    }

    // ==========================================================================
    // Detachment and cancellation
    // ==========================================================================

    #[test]
    fn test_detaching_last_waiter_cancels() {
        let log = Log::default();
        let mut pool = JobPool::new(JOB_POOL_SIZE);
        let mut job = running_job(&mut pool);
        let first = waiter(&log, 0);
        let second = waiter(&log, 1);
        let (first_id, second_id) = (first.id(), second.id());
        let flag = job.cancel_flag();
        let _ = job.attach(first);
        let _ = job.attach(second);

        assert_eq!(job.detach(first_id), Detach::Removed);
        assert_eq!(job.detach(first_id), Detach::Unknown);
        assert!(!flag.load(Ordering::Acquire));
        assert_eq!(job.detach(second_id), Detach::Cancelled);
        assert!(flag.load(Ordering::Acquire));
        assert!(job.is_cancelled());
        assert!(matches!(job.attach(waiter(&log, 2)), Attach::Rejected(_)));
        assert!(!job.cancel());
    }

    #[test]
    fn test_detach_after_completion_is_ignored() {
        let log = Log::default();
        let mut pool = JobPool::new(JOB_POOL_SIZE);
        let mut job = running_job(&mut pool);
        let w = waiter(&log, 0);
        let id = w.id();
        let _ = job.attach(w);
        let _ = job.complete(failed());
        assert_eq!(job.detach(id), Detach::Ignored);
        assert_eq!(job.detach(id), Detach::Ignored);
    }

    #[test]
    fn test_detached_flag_skips_delivery() {
        let log = Log::default();
        let mut pool = JobPool::new(JOB_POOL_SIZE);
        let mut job = running_job(&mut pool);
        let skipped = waiter(&log, 0);
        skipped.detached_flag().store(true, Ordering::Release);
        let delivered = waiter(&log, 1);
        let delivered_id = delivered.id();
        let _ = job.attach(skipped);
        let _ = job.attach(delivered);

        let waiters = job.complete(failed());
        assert_eq!(waiters.len(), 1);
        assert_eq!(waiters[0].id(), delivered_id);
    }

    // ==========================================================================
    // Pooling
    // ==========================================================================

    #[test]
    fn test_pool_resets_jobs_and_respects_capacity() {
        let log = Log::default();
        let mut pool = JobPool::new(1);
        let mut job = running_job(&mut pool);
        let _ = job.attach(waiter(&log, 0));
        let _ = job.complete(failed());
        pool.release(job);
        assert_eq!(pool.len(), 1);
        let extra = JobPool::new(1).acquire(key(), true, IoClass::Source);
        pool.release(extra);
        assert_eq!(pool.len(), 1);

        let reused = pool.acquire(key(), false, IoClass::DiskOnly);
        assert_eq!(reused.state(), JobState::Pending);
        assert_eq!(reused.waiter_count(), 0);
        assert!(!reused.is_cacheable());
        assert_eq!(reused.io_class(), IoClass::DiskOnly);
        assert!(!reused.cancel_flag().load(Ordering::Acquire));
    }
}
