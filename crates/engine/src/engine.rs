//! The load coordination context
//!
//! [`Engine`] owns every piece of shared bookkeeping: the job table, the
//! resource arena, the active set and the memory cache. It is driven from a
//! single thread; workers and consumers talk to it only by posting
//! [`Message`]s, so no lock guards the tables.
//!
//! A load is answered, in order, from the memory cache, the active set, an
//! in-flight job for the same key, or a newly started job.

use crate::active::ActiveResources;
use crate::arena::Arena;
use crate::buffer::BufferPool;
use crate::config::EngineConfig;
use crate::disk::{DiskCache, DiskCacheStrategy, DiskLruCacheWrapper, NoDiskCache};
use crate::error::{EngineError, LoadError, Result};
use crate::executor::{Executors, Priority};
use crate::job::{
    Attach, Detach, IoClass, JOB_POOL_SIZE, Job, JobId, JobPool, Outcome, Waiter, WaiterId,
};
use crate::key::RequestKey;
use crate::memory::{MemoryCache, TrimLevel};
use crate::pipeline::{DecodeContext, DecodePipeline, DecodeRequest, DecodeTask, Decoded};
use crate::resource::{DataSource, EngineResource, Released, ResourceHandle, ResourceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

/// Work posted to the coordination context
pub(crate) enum Message {
    Load {
        request: LoadRequest,
        waiter: Waiter,
    },
    Detach {
        key: RequestKey,
        waiter: WaiterId,
    },
    Release {
        resource: ResourceId,
    },
    JobDone {
        job: JobId,
        result: std::result::Result<Decoded, LoadError>,
    },
    Call(Box<dyn FnOnce(&mut Engine) + Send>),
    Shutdown,
}

/// What to load and how
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Identity of the resource
    pub key: RequestKey,
    /// Scheduling priority of a new job
    pub priority: Priority,
    /// Pools a new job may use
    pub io_class: IoClass,
    /// Whether memory tiers may answer and keep the result
    pub memory_cacheable: bool,
    /// Disk cache usage of a new job
    pub disk_strategy: DiskCacheStrategy,
}

impl LoadRequest {
    /// Request with default priority, pools and caching
    #[must_use]
    pub fn new(key: RequestKey) -> Self {
        Self {
            key,
            priority: Priority::default(),
            io_class: IoClass::default(),
            memory_cacheable: true,
            disk_strategy: DiskCacheStrategy::default(),
        }
    }

    /// Set the priority
    #[must_use]
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the pools
    #[must_use]
    pub const fn io_class(mut self, io_class: IoClass) -> Self {
        self.io_class = io_class;
        self
    }

    /// Allow or forbid the memory tiers
    #[must_use]
    pub const fn memory_cacheable(mut self, memory_cacheable: bool) -> Self {
        self.memory_cacheable = memory_cacheable;
        self
    }

    /// Set the disk cache strategy
    #[must_use]
    pub const fn disk_strategy(mut self, disk_strategy: DiskCacheStrategy) -> Self {
        self.disk_strategy = disk_strategy;
        self
    }

    /// Answer only from caches, failing with [`LoadError::NoResult`] otherwise
    #[must_use]
    pub const fn only_from_cache(self) -> Self {
        self.io_class(IoClass::DiskOnly)
    }
}

/// A successful load
pub struct Loaded {
    /// Holder of the resource; drop it to give the resource back
    pub resource: ResourceHandle,
    /// Where the resource came from
    pub source: DataSource,
}

impl fmt::Debug for Loaded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loaded")
            .field("resource", &self.resource)
            .field("source", &self.source)
            .finish()
    }
}

/// Ticket for a load still in flight
///
/// Cancelling is idempotent. A cancelled waiter is never invoked, even if the
/// job finished on a worker before the cancel was processed.
pub struct LoadHandle {
    key: RequestKey,
    waiter: WaiterId,
    detached: Arc<AtomicBool>,
    outbox: UnboundedSender<Message>,
}

impl LoadHandle {
    fn new(key: RequestKey, waiter: &Waiter, outbox: UnboundedSender<Message>) -> Self {
        Self {
            key,
            waiter: waiter.id(),
            detached: waiter.detached_flag(),
            outbox,
        }
    }

    /// Key being loaded
    #[must_use]
    pub const fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Stop waiting for the load
    pub fn cancel(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outbox.send(Message::Detach {
            key: self.key.clone(),
            waiter: self.waiter,
        });
    }

    /// Returns true once [`LoadHandle::cancel`] was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LoadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadHandle")
            .field("key", &self.key)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Point-in-time counters of the engine's tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Jobs still running, including cancelled ones awaiting their worker
    pub jobs: usize,
    /// Entries of the active set
    pub active: usize,
    /// Resources held by at least one consumer
    pub live_resources: usize,
    /// Idle resources in the memory cache
    pub memory_entries: usize,
    /// Bytes held by the memory cache
    pub memory_bytes: usize,
    /// Memory cache budget
    pub memory_max_bytes: usize,
    /// Capacity retained by the buffer pool
    pub buffer_pool_bytes: usize,
}

/// Configures an [`Engine`]
pub struct EngineBuilder {
    pipeline: Arc<dyn DecodePipeline>,
    config: EngineConfig,
    executors: Option<Executors>,
    disk_cache: Option<Arc<dyn DiskCache>>,
    buffers: Option<Arc<BufferPool>>,
}

impl EngineBuilder {
    /// Use `config` for budgets, pools and the disk cache location
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use these pools instead of building them from configuration
    #[must_use]
    pub fn executors(mut self, executors: Executors) -> Self {
        self.executors = Some(executors);
        self
    }

    /// Use this disk cache instead of the configured one
    #[must_use]
    pub fn disk_cache(mut self, disk_cache: Arc<dyn DiskCache>) -> Self {
        self.disk_cache = Some(disk_cache);
        self
    }

    /// Share an existing buffer pool
    #[must_use]
    pub fn buffer_pool(mut self, buffers: Arc<BufferPool>) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Create the engine
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;
        let executors = match self.executors {
            Some(executors) => executors,
            None => Executors::from_config(&config.pools)?,
        };
        let disk_cache: Arc<dyn DiskCache> = match self.disk_cache {
            Some(disk_cache) => disk_cache,
            None if config.disk_cache.enabled => Arc::new(DiskLruCacheWrapper::new(
                config.resolve_disk_cache_dir()?,
                config.disk_cache.max_bytes,
                config.disk_cache.app_version,
            )),
            None => Arc::new(NoDiskCache),
        };
        let buffers = self
            .buffers
            .unwrap_or_else(|| Arc::new(BufferPool::new(config.buffer_pool_bytes)));
        let (outbox, inbox) = mpsc::unbounded_channel();
        tracing::debug!(
            target: "pictor::engine",
            memory_cache_bytes = config.memory_cache_bytes,
            buffer_pool_bytes = config.buffer_pool_bytes,
            disk_cache = config.disk_cache.enabled,
            "Engine created"
        );
        Ok(Engine {
            jobs: Arena::new(),
            jobs_by_key: HashMap::new(),
            job_pool: JobPool::new(JOB_POOL_SIZE),
            resources: Arena::new(),
            active: ActiveResources::new(),
            memory: MemoryCache::new(config.memory_cache_bytes),
            buffers,
            disk_cache,
            pipeline: self.pipeline,
            executors,
            outbox,
            inbox,
            coordinator: Arc::new(OnceLock::new()),
            shut_down: false,
        })
    }
}

/// Single-threaded coordinator of loads, caches and pools
pub struct Engine {
    jobs: Arena<Job>,
    jobs_by_key: HashMap<RequestKey, JobId>,
    job_pool: JobPool,
    resources: Arena<EngineResource>,
    active: ActiveResources,
    memory: MemoryCache,
    buffers: Arc<BufferPool>,
    disk_cache: Arc<dyn DiskCache>,
    pipeline: Arc<dyn DecodePipeline>,
    executors: Executors,
    outbox: UnboundedSender<Message>,
    inbox: UnboundedReceiver<Message>,
    coordinator: Arc<OnceLock<ThreadId>>,
    shut_down: bool,
}

impl Engine {
    /// Start configuring an engine around `pipeline`
    #[must_use]
    pub fn builder(pipeline: impl DecodePipeline) -> EngineBuilder {
        EngineBuilder {
            pipeline: Arc::new(pipeline),
            config: EngineConfig::default(),
            executors: None,
            disk_cache: None,
            buffers: None,
        }
    }

    /// Engine built entirely from configuration
    pub fn from_config(config: EngineConfig, pipeline: impl DecodePipeline) -> Result<Self> {
        Self::builder(pipeline).config(config).build()
    }

    /// A sendable handle posting to this engine
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            outbox: self.outbox.clone(),
            coordinator: Arc::clone(&self.coordinator),
            disk_cache: Arc::clone(&self.disk_cache),
            thread: Arc::new(Mutex::new(None)),
        }
    }

    /// Move the engine onto a dedicated coordination thread
    pub fn spawn(self) -> Result<EngineHandle> {
        let handle = self.handle();
        let name = "pictor-coordinator".to_string();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut engine = self;
                engine.run();
            })
            .map_err(|source| EngineError::ThreadSpawn { name, source })?;
        *handle.thread.lock() = Some(thread);
        Ok(handle)
    }

    /// The disk cache shared with pipelines
    #[must_use]
    pub fn disk_cache(&self) -> &Arc<dyn DiskCache> {
        &self.disk_cache
    }

    /// The buffer pool shared with pipelines
    #[must_use]
    pub const fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Load a resource, invoking `callback` exactly once unless cancelled
    ///
    /// Returns `None` when the callback already ran because a memory tier or
    /// a finished job answered synchronously.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the coordination thread.
    pub fn load(
        &mut self,
        request: LoadRequest,
        callback: impl FnOnce(std::result::Result<Loaded, LoadError>) + Send + 'static,
    ) -> Option<LoadHandle> {
        self.enter();
        let waiter = Waiter::new(Box::new(callback));
        let handle = LoadHandle::new(request.key.clone(), &waiter, self.outbox.clone());
        self.load_waiter(request, waiter).then_some(handle)
    }

    /// Give back a resource immediately instead of via the handle's drop
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the coordination thread.
    pub fn release(&mut self, handle: ResourceHandle) {
        self.enter();
        let id = handle.disarm();
        self.release_resource(id);
    }

    /// Shed memory according to host pressure
    pub fn trim_memory(&mut self, level: TrimLevel) {
        self.enter();
        tracing::debug!(target: "pictor::engine", ?level, "Trimming memory");
        self.memory.trim_memory(level);
        self.buffers.trim_memory(level);
    }

    /// Empty the memory cache and the buffer pool
    pub fn clear_memory(&mut self) {
        self.enter();
        self.memory.clear_memory();
        self.buffers.clear();
    }

    /// Scale the memory cache budget
    pub fn set_size_multiplier(&mut self, multiplier: f64) -> Result<()> {
        self.enter();
        self.memory.set_size_multiplier(multiplier)
    }

    /// Counters of the engine's tables
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            jobs: self.jobs.len(),
            active: self.active.len(),
            live_resources: self.resources.len(),
            memory_entries: self.memory.len(),
            memory_bytes: self.memory.current_size(),
            memory_max_bytes: self.memory.max_size(),
            buffer_pool_bytes: self.buffers.current_bytes(),
        }
    }

    /// Returns true once the engine has shut down
    #[must_use]
    pub const fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Process messages until shutdown
    ///
    /// # Panics
    ///
    /// Panics if the engine was already driven from another thread.
    pub fn run(&mut self) {
        self.enter();
        tracing::info!(target: "pictor::engine", "Coordination loop started");
        loop {
            let message = match self.inbox.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => {
                    self.on_idle();
                    match self.inbox.blocking_recv() {
                        Some(message) => message,
                        None => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };
            if !self.handle_message(message) {
                break;
            }
        }
        self.shutdown();
    }

    /// Process every queued message without blocking; returns how many ran
    ///
    /// # Panics
    ///
    /// Panics if the engine was already driven from another thread.
    pub fn run_pending(&mut self) -> usize {
        self.enter();
        let mut handled = 0;
        while let Ok(message) = self.inbox.try_recv() {
            handled += 1;
            if !self.handle_message(message) {
                self.shutdown();
                return handled;
            }
        }
        self.on_idle();
        handled
    }

    /// Cancel outstanding jobs, empty memory tiers and stop the pools
    ///
    /// Waiters of outstanding jobs receive [`LoadError::Cancelled`]; loads
    /// still queued for the engine receive [`LoadError::EngineShutDown`].
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let mut cancelled = 0;
        for mut job in self.jobs.drain() {
            job.cancel();
            for waiter in job.take_waiters() {
                if !waiter.is_detached() {
                    cancelled += 1;
                    waiter.invoke(Err(LoadError::Cancelled));
                }
            }
        }
        self.jobs_by_key.clear();
        self.memory.clear_memory();
        self.buffers.clear();
        self.executors.shutdown();
        self.inbox.close();
        let rejected = self.drain_inbox();
        tracing::info!(target: "pictor::engine", cancelled, rejected, "Engine shut down");
    }

    /// Answer what was queued before the inbox closed; returns how many loads
    /// were turned away
    fn drain_inbox(&mut self) -> usize {
        let mut rejected = 0;
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                Message::Load { waiter, .. } => {
                    if !waiter.is_detached() {
                        rejected += 1;
                        waiter.invoke(Err(LoadError::EngineShutDown));
                    }
                }
                Message::JobDone { job, result } => self.on_job_done(job, result),
                Message::Detach { .. }
                | Message::Release { .. }
                | Message::Call(_)
                | Message::Shutdown => {}
            }
        }
        rejected
    }

    fn enter(&self) {
        let current = thread::current().id();
        let owner = *self.coordinator.get_or_init(|| current);
        assert!(
            owner == current,
            "engine driven from {current:?} but bound to coordination thread {owner:?}"
        );
    }

    fn on_idle(&mut self) {
        let pruned = self.active.prune(&self.resources);
        if pruned > 0 {
            tracing::trace!(target: "pictor::engine", pruned, "Pruned active set");
        }
    }

    fn handle_message(&mut self, message: Message) -> bool {
        match message {
            Message::Load { request, waiter } => {
                self.load_waiter(request, waiter);
            }
            Message::Detach { key, waiter } => self.detach(&key, waiter),
            Message::Release { resource } => self.release_resource(resource),
            Message::JobDone { job, result } => self.on_job_done(job, result),
            Message::Call(call) => call(self),
            Message::Shutdown => return false,
        }
        true
    }

    /// Returns true if the waiter was attached to a job
    fn load_waiter(&mut self, request: LoadRequest, waiter: Waiter) -> bool {
        if self.shut_down {
            waiter.invoke(Err(LoadError::EngineShutDown));
            return false;
        }
        if waiter.is_detached() {
            return false;
        }

        if request.memory_cacheable {
            if let Some(id) = self.load_from_memory(&request.key) {
                tracing::trace!(target: "pictor::engine", key = %request.key, "Loaded from memory cache");
                self.deliver(waiter, id, DataSource::MemoryCache);
                self.settle(id);
                return false;
            }
            if let Some(id) = self.active.get(&request.key, &self.resources) {
                tracing::trace!(target: "pictor::engine", key = %request.key, "Loaded from active resources");
                self.deliver(waiter, id, DataSource::MemoryCache);
                return false;
            }
        }

        let mut waiter = waiter;
        if let Some(&job_id) = self.jobs_by_key.get(&request.key)
            && let Some(job) = self.jobs.get_mut(job_id.0)
        {
            match job.attach(waiter) {
                Attach::Queued => {
                    tracing::trace!(target: "pictor::engine", key = %request.key, "Added to existing load");
                    return true;
                }
                // Finished and cancelled jobs leave the table before they
                // deliver, so a terminal job here is a stale entry.
                Attach::Replay(late, outcome) => {
                    tracing::warn!(target: "pictor::engine", key = %request.key, ?outcome, "Stale job in key table");
                    self.jobs_by_key.remove(&request.key);
                    waiter = late;
                }
                Attach::Rejected(rejected) => {
                    self.jobs_by_key.remove(&request.key);
                    waiter = rejected;
                }
            }
        }

        self.start_job(request, waiter);
        true
    }

    fn load_from_memory(&mut self, key: &RequestKey) -> Option<ResourceId> {
        let resource = self.memory.remove(key)?;
        Some(ResourceId(self.resources.insert(resource)))
    }

    /// Activate a resource taken from memory, or put it back if no one held on
    fn settle(&mut self, id: ResourceId) {
        let Some(resource) = self.resources.get(id.0) else {
            return;
        };
        if resource.acquired() > 0 {
            let key = resource.key().clone();
            self.active.activate(key, id);
        } else {
            self.on_idle_resource(id);
        }
    }

    fn start_job(&mut self, request: LoadRequest, waiter: Waiter) {
        let LoadRequest {
            key,
            priority,
            io_class,
            memory_cacheable,
            disk_strategy,
        } = request;
        let mut job = self
            .job_pool
            .acquire(key.clone(), memory_cacheable, io_class);
        let context = DecodeContext::new(
            job.cancel_flag(),
            Arc::clone(&self.disk_cache),
            Arc::clone(&self.buffers),
        );
        let _ = job.attach(waiter);
        job.start();
        let id = JobId(self.jobs.insert(job));
        self.jobs_by_key.insert(key.clone(), id);
        tracing::debug!(target: "pictor::engine", key = %key, ?priority, ?io_class, "Started new load");

        let task = DecodeTask::new(
            id,
            DecodeRequest::new(key, priority, io_class, disk_strategy),
            context,
            Arc::clone(&self.pipeline),
            self.executors.clone(),
            self.outbox.clone(),
        );
        task.start();
    }

    fn detach(&mut self, key: &RequestKey, waiter: WaiterId) {
        let Some(&job_id) = self.jobs_by_key.get(key) else {
            return;
        };
        let Some(job) = self.jobs.get_mut(job_id.0) else {
            return;
        };
        if job.detach(waiter) == Detach::Cancelled {
            self.jobs_by_key.remove(key);
            tracing::debug!(target: "pictor::engine", key = %key, "Cancelled load without waiters");
        }
    }

    fn on_job_done(&mut self, job_id: JobId, result: std::result::Result<Decoded, LoadError>) {
        let Some(mut job) = self.jobs.remove(job_id.0) else {
            // The engine shut down after the job was scheduled.
            if let Ok(decoded) = result {
                decoded.resource.recycle();
            }
            return;
        };
        if self.jobs_by_key.get(job.key()) == Some(&job_id) {
            self.jobs_by_key.remove(job.key());
        }

        if job.is_cancelled() {
            if let Ok(decoded) = result {
                decoded.resource.recycle();
            }
            tracing::trace!(target: "pictor::engine", key = %job.key(), "Discarded result of cancelled load");
            self.job_pool.release(job);
            return;
        }

        match result {
            Ok(decoded) => {
                let source = decoded.source;
                let resource =
                    EngineResource::new(job.key().clone(), decoded.resource, job.is_cacheable());
                let id = ResourceId(self.resources.insert(resource));
                // Held for the duration of delivery so the resource survives
                // even if every waiter turns out to be detached.
                self.acquire(id);
                if job.is_cacheable() {
                    self.active.activate(job.key().clone(), id);
                }
                let waiters = job.complete(Outcome::Completed {
                    resource: id,
                    source,
                });
                tracing::debug!(
                    target: "pictor::engine",
                    key = %job.key(),
                    %source,
                    waiters = waiters.len(),
                    "Load completed"
                );
                for waiter in waiters {
                    self.deliver(waiter, id, source);
                }
                self.release_resource(id);
            }
            Err(error) => {
                let waiters = job.complete(Outcome::Failed(error.clone()));
                tracing::debug!(
                    target: "pictor::engine",
                    key = %job.key(),
                    error = %error,
                    waiters = waiters.len(),
                    "Load failed"
                );
                for waiter in waiters {
                    waiter.invoke(Err(error.clone()));
                }
            }
        }
        self.job_pool.release(job);
    }

    fn acquire(&mut self, id: ResourceId) {
        if let Some(resource) = self.resources.get_mut(id.0) {
            resource.acquire();
        }
    }

    fn deliver(&mut self, waiter: Waiter, id: ResourceId, source: DataSource) {
        if waiter.is_detached() {
            return;
        }
        let Some(resource) = self.resources.get_mut(id.0) else {
            return;
        };
        resource.acquire();
        let handle = ResourceHandle::new(
            resource.key().clone(),
            id,
            resource.share(),
            self.outbox.clone(),
        );
        waiter.invoke(Ok(Loaded {
            resource: handle,
            source,
        }));
    }

    fn release_resource(&mut self, id: ResourceId) {
        let resource = self.resources.get_mut(id.0);
        assert!(
            resource.is_some(),
            "released resource {id:?} that is no longer live"
        );
        if let Some(resource) = resource
            && resource.release() == Released::Idle
        {
            self.on_idle_resource(id);
        }
    }

    fn on_idle_resource(&mut self, id: ResourceId) {
        let Some(resource) = self.resources.remove(id.0) else {
            return;
        };
        self.active.deactivate(resource.key(), id);
        if resource.is_cacheable() && !self.shut_down {
            let key = resource.key().clone();
            self.memory.put(key, resource);
        } else {
            resource.recycle();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("stats", &self.stats())
            .field("executors", &self.executors)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

/// Cancels a pending load when its future is dropped early
struct CancelOnDrop(Option<LoadHandle>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.cancel();
        }
    }
}

/// Sendable front door to an engine running elsewhere
#[derive(Clone)]
pub struct EngineHandle {
    outbox: UnboundedSender<Message>,
    coordinator: Arc<OnceLock<ThreadId>>,
    disk_cache: Arc<dyn DiskCache>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    /// Post a load; `callback` runs on the coordination thread
    pub fn load(
        &self,
        request: LoadRequest,
        callback: impl FnOnce(std::result::Result<Loaded, LoadError>) + Send + 'static,
    ) -> LoadHandle {
        let waiter = Waiter::new(Box::new(callback));
        let handle = LoadHandle::new(request.key.clone(), &waiter, self.outbox.clone());
        if let Err(unsent) = self.outbox.send(Message::Load { request, waiter })
            && let Message::Load { waiter, .. } = unsent.0
        {
            waiter.invoke(Err(LoadError::EngineShutDown));
        }
        handle
    }

    /// Load and block the calling thread until the outcome arrives
    ///
    /// # Panics
    ///
    /// Panics when called on the coordination thread, which would deadlock.
    pub fn get_blocking(&self, request: LoadRequest) -> std::result::Result<Loaded, LoadError> {
        assert!(
            !self.is_coordination_thread(),
            "get_blocking called on the coordination thread"
        );
        let (tx, rx) = oneshot::channel();
        let _handle = self.load(request, move |result| {
            let _ = tx.send(result);
        });
        rx.blocking_recv()
            .unwrap_or(Err(LoadError::EngineShutDown))
    }

    /// Load asynchronously; dropping the future cancels the load
    pub fn load_async(
        &self,
        request: LoadRequest,
    ) -> impl Future<Output = std::result::Result<Loaded, LoadError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let handle = self.load(request, move |result| {
            let _ = tx.send(result);
        });
        let guard = CancelOnDrop(Some(handle));
        async move {
            let result = rx.await.unwrap_or(Err(LoadError::EngineShutDown));
            guard.disarm();
            result
        }
    }

    /// Shed memory according to host pressure
    pub fn trim_memory(&self, level: TrimLevel) {
        self.call(move |engine| engine.trim_memory(level));
    }

    /// Empty the memory cache and the buffer pool
    pub fn clear_memory(&self) {
        self.call(Engine::clear_memory);
    }

    /// Scale the memory cache budget; invalid multipliers are logged
    pub fn set_size_multiplier(&self, multiplier: f64) {
        self.call(move |engine| {
            if let Err(e) = engine.set_size_multiplier(multiplier) {
                tracing::warn!(target: "pictor::engine", error = %e, "Ignored size multiplier");
            }
        });
    }

    /// Counters of the engine's tables, or `None` once it is gone
    ///
    /// # Panics
    ///
    /// Panics when called on the coordination thread.
    #[must_use]
    pub fn stats(&self) -> Option<EngineStats> {
        assert!(
            !self.is_coordination_thread(),
            "stats requested on the coordination thread"
        );
        let (tx, rx) = oneshot::channel();
        self.call(move |engine| {
            let _ = tx.send(engine.stats());
        });
        rx.blocking_recv().ok()
    }

    /// Remove every disk cache entry on the calling thread
    ///
    /// # Panics
    ///
    /// Panics when called on the coordination thread.
    pub fn clear_disk_cache(&self) {
        assert!(
            !self.is_coordination_thread(),
            "clear_disk_cache must not run on the coordination thread"
        );
        self.disk_cache.clear();
    }

    /// Stop the engine and wait for its thread if it was spawned
    pub fn shutdown(&self) {
        let _ = self.outbox.send(Message::Shutdown);
        let thread = self.thread.lock().take();
        if let Some(thread) = thread
            && thread.thread().id() != thread::current().id()
            && thread.join().is_err()
        {
            tracing::error!(target: "pictor::engine", "Coordination thread panicked");
        }
    }

    fn call(&self, call: impl FnOnce(&mut Engine) + Send + 'static) {
        let _ = self.outbox.send(Message::Call(Box::new(call)));
    }

    fn is_coordination_thread(&self) -> bool {
        self.coordinator.get() == Some(&thread::current().id())
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("coordinator", &self.coordinator.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Model;
    use crate::resource::BytesResource;

    struct Echo;

    impl DecodePipeline for Echo {
        fn decode_source(
            &self,
            request: &DecodeRequest,
            _context: &DecodeContext,
        ) -> std::result::Result<Decoded, LoadError> {
            let bytes = request.key().to_string().into_bytes();
            Ok(Decoded::new(BytesResource::new(bytes), DataSource::Local))
        }
    }

    fn engine() -> Engine {
        Engine::builder(Echo)
            .executors(Executors::direct())
            .disk_cache(Arc::new(NoDiskCache))
            .build()
            .unwrap()
    }

    fn request(name: &str) -> LoadRequest {
        LoadRequest::new(RequestKey::builder(Model::Asset(name.to_string())).build())
            .disk_strategy(DiskCacheStrategy::None)
    }

    #[test]
    fn test_memory_hit_moves_resource_to_active_set() {
        let mut engine = engine();
        let first = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&first);
        engine.load(request("a"), move |r| *slot.lock() = Some(r.unwrap()));
        engine.run_pending();
        let loaded = first.lock().take().unwrap();
        assert_eq!(loaded.source, DataSource::Local);
        drop(loaded);
        engine.run_pending();
        assert_eq!(engine.stats().memory_entries, 1);
        assert_eq!(engine.stats().live_resources, 0);

        let second = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&second);
        assert!(engine
            .load(request("a"), move |r| *slot.lock() = Some(r.unwrap()))
            .is_none());
        let loaded = second.lock().take().unwrap();
        assert_eq!(loaded.source, DataSource::MemoryCache);
        let stats = engine.stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.live_resources, 1);
        engine.release(loaded.resource);
        assert_eq!(engine.stats().memory_entries, 1);
    }

    #[test]
    fn test_enter_binds_to_first_thread() {
        let mut engine = engine();
        engine.run_pending();
        let coordinator = *engine.coordinator.get().unwrap();
        assert_eq!(coordinator, thread::current().id());
        let result = thread::spawn(move || {
            let mut engine = engine;
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| engine.run_pending())).is_err()
        })
        .join()
        .unwrap();
        assert!(result);
    }

    #[test]
    fn test_shutdown_rejects_later_loads() {
        let mut engine = engine();
        engine.shutdown();
        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        assert!(engine
            .load(request("a"), move |r| *slot.lock() = Some(r.map(|_| ())))
            .is_none());
        assert_eq!(*outcome.lock(), Some(Err(LoadError::EngineShutDown)));
    }
}
