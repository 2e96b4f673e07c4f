//! Boundary between the engine and the code that produces resources
//!
//! The engine knows nothing about fetching or decoding. It hands each job to
//! a [`DecodePipeline`], first on the disk cache pool when the request's
//! strategy allows reading cached data and then, on a miss, on the source
//! pool chosen by the request's [`IoClass`].

use crate::buffer::BufferPool;
use crate::disk::{DiskCache, DiskCacheStrategy, DiskKey};
use crate::engine::Message;
use crate::error::LoadError;
use crate::executor::{self, Executor, Executors, Priority};
use crate::job::{IoClass, JobId};
use crate::key::RequestKey;
use crate::resource::{DataSource, Resource};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedSender;

/// A resource produced by a pipeline
pub struct Decoded {
    /// The decoded value
    pub resource: Box<dyn Resource>,
    /// Where its data came from
    pub source: DataSource,
}

impl Decoded {
    /// Wrap a decoded value
    #[must_use]
    pub fn new(resource: impl Resource, source: DataSource) -> Self {
        Self {
            resource: Box::new(resource),
            source,
        }
    }
}

impl fmt::Debug for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoded")
            .field("size", &self.resource.size())
            .field("source", &self.source)
            .finish()
    }
}

/// Everything a pipeline needs to know about one load
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    key: RequestKey,
    priority: Priority,
    io_class: IoClass,
    strategy: DiskCacheStrategy,
    resource_disk_key: DiskKey,
    source_disk_key: DiskKey,
}

impl DecodeRequest {
    pub(crate) fn new(
        key: RequestKey,
        priority: Priority,
        io_class: IoClass,
        strategy: DiskCacheStrategy,
    ) -> Self {
        let resource_disk_key = key.resource_disk_key();
        let source_disk_key = key.source_disk_key();
        Self {
            key,
            priority,
            io_class,
            strategy,
            resource_disk_key,
            source_disk_key,
        }
    }

    /// The request key being loaded
    #[must_use]
    pub const fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Scheduling priority
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Pools the load may use
    #[must_use]
    pub const fn io_class(&self) -> IoClass {
        self.io_class
    }

    /// Disk cache strategy
    #[must_use]
    pub const fn strategy(&self) -> DiskCacheStrategy {
        self.strategy
    }

    /// Disk key of the transformed resource
    #[must_use]
    pub const fn resource_disk_key(&self) -> &DiskKey {
        &self.resource_disk_key
    }

    /// Disk key of the unmodified source data
    #[must_use]
    pub const fn source_disk_key(&self) -> &DiskKey {
        &self.source_disk_key
    }
}

/// Shared services available to pipeline stages
#[derive(Clone)]
pub struct DecodeContext {
    cancelled: Arc<AtomicBool>,
    disk_cache: Arc<dyn DiskCache>,
    buffers: Arc<BufferPool>,
}

impl DecodeContext {
    pub(crate) fn new(
        cancelled: Arc<AtomicBool>,
        disk_cache: Arc<dyn DiskCache>,
        buffers: Arc<BufferPool>,
    ) -> Self {
        Self {
            cancelled,
            disk_cache,
            buffers,
        }
    }

    /// Returns true once every waiter lost interest
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The engine's disk cache
    #[must_use]
    pub fn disk_cache(&self) -> &dyn DiskCache {
        self.disk_cache.as_ref()
    }

    /// The engine's buffer pool
    #[must_use]
    pub const fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Fail fast if the current pool forbids network access
    ///
    /// # Panics
    ///
    /// Panics when called from the disk cache pool.
    pub fn ensure_network_permitted(&self) {
        executor::assert_network_permitted();
    }
}

impl fmt::Debug for DecodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeContext")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Produces resources for the engine
pub trait DecodePipeline: Send + Sync + 'static {
    /// Decode from the disk cache; `Ok(None)` is a miss
    ///
    /// Runs on the disk cache pool, where network access is forbidden.
    fn decode_cached(
        &self,
        request: &DecodeRequest,
        context: &DecodeContext,
    ) -> Result<Option<Decoded>, LoadError> {
        let _ = (request, context);
        Ok(None)
    }

    /// Fetch and decode from the source
    fn decode_source(
        &self,
        request: &DecodeRequest,
        context: &DecodeContext,
    ) -> Result<Decoded, LoadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Cache,
    Source,
}

/// Runs one job through the pipeline and reports back to the engine
pub(crate) struct DecodeTask {
    job: JobId,
    request: Arc<DecodeRequest>,
    context: DecodeContext,
    pipeline: Arc<dyn DecodePipeline>,
    executors: Executors,
    outbox: UnboundedSender<Message>,
}

impl DecodeTask {
    pub(crate) fn new(
        job: JobId,
        request: DecodeRequest,
        context: DecodeContext,
        pipeline: Arc<dyn DecodePipeline>,
        executors: Executors,
        outbox: UnboundedSender<Message>,
    ) -> Self {
        Self {
            job,
            request: Arc::new(request),
            context,
            pipeline,
            executors,
            outbox,
        }
    }

    pub(crate) fn start(self) {
        if self.request.strategy.reads_disk_cache() {
            let executor = self.executors.disk_cache.clone();
            self.submit(&executor, Stage::Cache);
        } else if self.request.io_class == IoClass::DiskOnly {
            let key = self.request.key.to_string();
            self.finish(Err(LoadError::no_result(key)));
        } else {
            let executor = self.executors.source_for(self.request.io_class).clone();
            self.submit(&executor, Stage::Source);
        }
    }

    fn submit(self, executor: &Executor, stage: Stage) {
        let job = self.job;
        let priority = self.request.priority;
        let key = self.request.key.to_string();
        let outbox = self.outbox.clone();
        if let Err(e) = executor.execute(priority, move || self.run(stage)) {
            tracing::warn!(target: "pictor::engine", key = %key, error = %e, "Unable to schedule load");
            post(&outbox, job, Err(LoadError::from_error(key, &e)));
        }
    }

    fn run(self, stage: Stage) {
        if self.context.is_cancelled() {
            self.finish(Err(LoadError::Cancelled));
            return;
        }
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| match stage {
            Stage::Cache => self.pipeline.decode_cached(&self.request, &self.context),
            Stage::Source => self
                .pipeline
                .decode_source(&self.request, &self.context)
                .map(Some),
        }));
        match attempt {
            Ok(Ok(Some(decoded))) => self.finish(Ok(decoded)),
            Ok(Ok(None)) => self.on_miss(stage),
            Ok(Err(error)) => self.finish(Err(error)),
            Err(payload) => {
                let message = executor::panic_message(payload.as_ref());
                self.finish(Err(LoadError::Panicked { message }));
                panic::resume_unwind(payload);
            }
        }
    }

    fn on_miss(self, stage: Stage) {
        let key = self.request.key.to_string();
        match (stage, self.request.io_class) {
            (Stage::Cache, IoClass::DiskOnly) | (Stage::Source, _) => {
                self.finish(Err(LoadError::no_result(key)));
            }
            (Stage::Cache, io_class) => {
                if self.context.is_cancelled() {
                    self.finish(Err(LoadError::Cancelled));
                    return;
                }
                tracing::trace!(target: "pictor::engine", key = %key, "Disk cache miss, switching to source");
                let executor = self.executors.source_for(io_class).clone();
                self.submit(&executor, Stage::Source);
            }
        }
    }

    fn finish(&self, result: Result<Decoded, LoadError>) {
        post(&self.outbox, self.job, result);
    }
}

fn post(outbox: &UnboundedSender<Message>, job: JobId, result: Result<Decoded, LoadError>) {
    if let Err(unsent) = outbox.send(Message::JobDone { job, result })
        && let Message::JobDone {
            result: Ok(decoded),
            ..
        } = unsent.0
    {
        decoded.resource.recycle();
    }
}
