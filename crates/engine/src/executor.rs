//! Worker pools segregated by I/O class
//!
//! Three pools back the engine: a single disk-cache thread that must never
//! touch the network, a bounded source pool, and an unbounded hand-off pool
//! whose idle threads retire after a keep-alive. Tasks are ordered by
//! [`Priority`] and then by submission order. A direct executor runs tasks on
//! the submitting thread for tests and synchronous embedding.

use crate::config::PoolsConfig;
use crate::error::{EngineError, Result};
use crate::job::IoClass;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

/// Upper bound for automatically sized pools
const MAXIMUM_AUTOMATIC_THREAD_COUNT: usize = 4;

/// How long idle threads of the unbounded pool linger
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10);

/// Scheduling priority; earlier variants run first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Needed right now
    Immediate,
    /// Visible soon
    High,
    /// Ordinary loads
    #[default]
    Normal,
    /// Prefetching
    Low,
}

/// What a pool does with a task that panics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanicPolicy {
    /// Swallow the panic
    Ignore,
    /// Log the panic and keep the worker alive
    #[default]
    Log,
    /// Let the panic unwind the worker thread
    Propagate,
}

/// Whether tasks of a pool may perform network I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkPolicy {
    /// Network access is allowed
    #[default]
    Permitted,
    /// Network access is a programming error
    Forbidden,
}

thread_local! {
    static NETWORK_PERMITTED: Cell<bool> = const { Cell::new(true) };
}

/// Returns true unless the current thread belongs to a network-forbidden pool
#[must_use]
pub fn network_permitted() -> bool {
    NETWORK_PERMITTED.with(Cell::get)
}

/// Fail fast when network I/O is attempted on a forbidden thread
///
/// # Panics
///
/// Panics on threads of a pool built with [`NetworkPolicy::Forbidden`].
pub fn assert_network_permitted() {
    assert!(
        network_permitted(),
        "network access is forbidden on thread {}",
        thread::current().name().unwrap_or("<unnamed>")
    );
}

/// Sets the thread's network flag and restores the previous one on drop
struct NetworkScope {
    previous: bool,
}

impl NetworkScope {
    fn enter(policy: NetworkPolicy) -> Self {
        let previous = NETWORK_PERMITTED.with(|flag| flag.replace(policy == NetworkPolicy::Permitted));
        Self { previous }
    }
}

impl Drop for NetworkScope {
    fn drop(&mut self) {
        NETWORK_PERMITTED.with(|flag| flag.set(self.previous));
    }
}

/// Number of threads for automatically sized pools
#[must_use]
pub fn best_thread_count() -> usize {
    static COUNT: OnceLock<usize> = OnceLock::new();
    *COUNT.get_or_init(|| {
        thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .clamp(1, MAXIMUM_AUTOMATIC_THREAD_COUNT)
    })
}

type Work = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    priority: Priority,
    seq: u64,
    work: Work,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    // BinaryHeap pops the greatest task: highest priority, then oldest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Direct,
    Pooled,
}

#[derive(Default)]
struct PoolState {
    queue: BinaryHeap<Task>,
    threads: usize,
    idle: usize,
    next_seq: u64,
    next_thread: usize,
    shutdown: bool,
}

struct Shared {
    name: String,
    mode: Mode,
    core_threads: usize,
    max_threads: usize,
    keep_alive: Option<Duration>,
    network: NetworkPolicy,
    panic_policy: PanicPolicy,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// A priority-ordered pool of worker threads
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    /// Start configuring a pool called `name`
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ExecutorBuilder {
        ExecutorBuilder::new(name)
    }

    /// Single thread for disk cache work; network access is forbidden
    pub fn disk_cache() -> Result<Self> {
        Self::builder("disk-cache")
            .threads(1)
            .network(NetworkPolicy::Forbidden)
            .build()
    }

    /// Bounded pool for fetching and decoding sources
    pub fn source() -> Result<Self> {
        Self::builder("source").threads(best_thread_count()).build()
    }

    /// Unbounded hand-off pool for sources that must not queue
    pub fn source_unlimited() -> Result<Self> {
        Self::builder("source-unlimited")
            .unlimited()
            .keep_alive(DEFAULT_KEEP_ALIVE)
            .build()
    }

    /// Executor that runs every task on the submitting thread
    #[must_use]
    pub fn direct(name: impl Into<String>) -> Self {
        Self::builder(name).direct().into_executor()
    }

    /// Name used for worker threads and log fields
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Network policy applied to tasks
    #[must_use]
    pub fn network_policy(&self) -> NetworkPolicy {
        self.shared.network
    }

    /// Live worker threads
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().threads
    }

    /// Tasks waiting for a worker
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Returns true once [`Executor::shutdown`] was called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Submit a task
    ///
    /// Fails if the pool is shut down or a needed worker thread cannot be
    /// spawned; the task is dropped in both cases.
    pub fn execute(&self, priority: Priority, work: impl FnOnce() + Send + 'static) -> Result<()> {
        let shared = &self.shared;
        if shared.mode == Mode::Direct {
            let _scope = NetworkScope::enter(shared.network);
            run_task(shared, Box::new(work));
            return Ok(());
        }

        let mut state = shared.state.lock();
        if state.shutdown {
            return Err(EngineError::Rejected {
                executor: shared.name.clone(),
            });
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Task {
            priority,
            seq,
            work: Box::new(work),
        });

        if state.idle >= state.queue.len() || state.threads >= shared.max_threads {
            drop(state);
            shared.available.notify_one();
            return Ok(());
        }

        state.threads += 1;
        let id = state.next_thread;
        state.next_thread += 1;
        drop(state);
        if let Err(e) = spawn_worker(Arc::clone(shared), id) {
            let mut state = shared.state.lock();
            state.threads -= 1;
            state.queue.retain(|task| task.seq != seq);
            return Err(e);
        }
        Ok(())
    }

    /// Stop accepting work; workers exit once the queue is drained
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.available.notify_all();
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.shared.name)
            .field("mode", &self.shared.mode)
            .field("max_threads", &self.shared.max_threads)
            .field("network", &self.shared.network)
            .finish_non_exhaustive()
    }
}

/// Configures an [`Executor`]
#[derive(Debug, Clone)]
pub struct ExecutorBuilder {
    name: String,
    mode: Mode,
    core_threads: usize,
    max_threads: usize,
    keep_alive: Option<Duration>,
    network: NetworkPolicy,
    panic_policy: PanicPolicy,
}

impl ExecutorBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Pooled,
            core_threads: 1,
            max_threads: 1,
            keep_alive: None,
            network: NetworkPolicy::Permitted,
            panic_policy: PanicPolicy::default(),
        }
    }

    /// Fixed number of worker threads
    #[must_use]
    pub const fn threads(mut self, count: usize) -> Self {
        self.core_threads = count;
        self.max_threads = count;
        self
    }

    /// No core threads and no upper bound; every task without an idle
    /// worker gets a new thread
    #[must_use]
    pub const fn unlimited(mut self) -> Self {
        self.core_threads = 0;
        self.max_threads = usize::MAX;
        self
    }

    /// Retire threads beyond the core count after idling this long
    #[must_use]
    pub const fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Network policy for tasks
    #[must_use]
    pub const fn network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    /// Handling of panicking tasks
    #[must_use]
    pub const fn panic_policy(mut self, panic_policy: PanicPolicy) -> Self {
        self.panic_policy = panic_policy;
        self
    }

    /// Run tasks on the submitting thread
    #[must_use]
    pub const fn direct(mut self) -> Self {
        self.mode = Mode::Direct;
        self
    }

    /// Validate and create the executor; no thread starts before the first
    /// task arrives
    pub fn build(self) -> Result<Executor> {
        if self.mode == Mode::Pooled && self.max_threads == 0 {
            return Err(EngineError::configuration(format!(
                "executor {} needs at least one thread",
                self.name
            )));
        }
        Ok(self.into_executor())
    }

    fn into_executor(self) -> Executor {
        Executor {
            shared: Arc::new(Shared {
                name: self.name,
                mode: self.mode,
                core_threads: self.core_threads,
                max_threads: self.max_threads,
                keep_alive: self.keep_alive,
                network: self.network,
                panic_policy: self.panic_policy,
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
            }),
        }
    }
}

fn spawn_worker(shared: Arc<Shared>, id: usize) -> Result<()> {
    let name = format!("pictor-{}-{id}", shared.name);
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || worker_loop(shared))
        .map(|_| ())
        .map_err(|source| EngineError::ThreadSpawn { name, source })
}

/// Decrements the live thread count however the worker exits
///
/// A worker unwound by a propagated panic leaves a replacement behind while
/// tasks are still queued, so nothing waits for a later `execute`.
struct WorkerExit(Arc<Shared>);

impl Drop for WorkerExit {
    fn drop(&mut self) {
        let shared = &self.0;
        let mut state = shared.state.lock();
        state.threads -= 1;
        if !thread::panicking() || state.queue.is_empty() || state.idle >= state.queue.len() {
            return;
        }
        state.threads += 1;
        let id = state.next_thread;
        state.next_thread += 1;
        drop(state);

        if let Err(e) = spawn_worker(Arc::clone(shared), id) {
            shared.state.lock().threads -= 1;
            tracing::error!(
                target: "pictor::executor",
                executor = %shared.name,
                error = %e,
                "Failed to replace panicked worker"
            );
        } else {
            tracing::debug!(
                target: "pictor::executor",
                executor = %shared.name,
                "Replaced panicked worker"
            );
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let exit = WorkerExit(shared);
    let shared = &*exit.0;
    let _scope = NetworkScope::enter(shared.network);
    tracing::trace!(target: "pictor::executor", executor = %shared.name, "Worker started");
    while let Some(task) = next_task(shared) {
        run_task(shared, task.work);
    }
    tracing::trace!(target: "pictor::executor", executor = %shared.name, "Worker exiting");
}

fn next_task(shared: &Shared) -> Option<Task> {
    let mut state = shared.state.lock();
    loop {
        if let Some(task) = state.queue.pop() {
            return Some(task);
        }
        if state.shutdown {
            return None;
        }
        state.idle += 1;
        let timed_out = match shared.keep_alive {
            Some(keep_alive) if state.threads > shared.core_threads => shared
                .available
                .wait_for(&mut state, keep_alive)
                .timed_out(),
            _ => {
                shared.available.wait(&mut state);
                false
            }
        };
        state.idle -= 1;
        if timed_out && state.queue.is_empty() {
            return None;
        }
    }
}

fn run_task(shared: &Shared, work: Work) {
    let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) else {
        return;
    };
    match shared.panic_policy {
        PanicPolicy::Ignore => {}
        PanicPolicy::Log => {
            tracing::error!(
                target: "pictor::executor",
                executor = %shared.name,
                panic = %panic_message(payload.as_ref()),
                "Task panicked"
            );
        }
        PanicPolicy::Propagate => panic::resume_unwind(payload),
    }
}

/// Render a panic payload as text
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The pools an engine schedules onto
#[derive(Debug, Clone)]
pub struct Executors {
    /// Reads from the disk cache
    pub disk_cache: Executor,
    /// Fetches and decodes sources
    pub source: Executor,
    /// Fetches sources that must never queue behind others
    pub source_unlimited: Executor,
}

impl Executors {
    /// Default pools
    pub fn new() -> Result<Self> {
        Ok(Self {
            disk_cache: Executor::disk_cache()?,
            source: Executor::source()?,
            source_unlimited: Executor::source_unlimited()?,
        })
    }

    /// Pools sized by configuration
    pub fn from_config(config: &PoolsConfig) -> Result<Self> {
        let policy = config.panic_policy;
        Ok(Self {
            disk_cache: Executor::builder("disk-cache")
                .threads(config.disk_threads)
                .network(NetworkPolicy::Forbidden)
                .panic_policy(policy)
                .build()?,
            source: Executor::builder("source")
                .threads(config.source_threads.unwrap_or_else(best_thread_count))
                .panic_policy(policy)
                .build()?,
            source_unlimited: Executor::builder("source-unlimited")
                .unlimited()
                .keep_alive(Duration::from_millis(config.unlimited_keep_alive_ms))
                .panic_policy(policy)
                .build()?,
        })
    }

    /// Inline executors; the disk executor still forbids network access
    #[must_use]
    pub fn direct() -> Self {
        Self {
            disk_cache: Executor::builder("disk-cache")
                .direct()
                .network(NetworkPolicy::Forbidden)
                .into_executor(),
            source: Executor::direct("source"),
            source_unlimited: Executor::direct("source-unlimited"),
        }
    }

    /// Pool that fetches sources for `io_class`
    #[must_use]
    pub const fn source_for(&self, io_class: IoClass) -> &Executor {
        match io_class {
            IoClass::SourceUnlimited => &self.source_unlimited,
            IoClass::DiskOnly | IoClass::Source => &self.source,
        }
    }

    /// Shut every pool down
    pub fn shutdown(&self) {
        self.disk_cache.shutdown();
        self.source.shutdown();
        self.source_unlimited.shutdown();
    }
}
