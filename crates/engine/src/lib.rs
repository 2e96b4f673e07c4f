//! Load coordination engine for decoded images
//!
//! This crate deduplicates and caches expensive loads:
//! - Request keys that identify a load by model, size, signature,
//!   transformations and options, with stable disk digests
//! - A single coordination context that merges concurrent requests for the
//!   same key into one job and fans the outcome out to every waiter
//! - Two memory tiers: the active set of resources held by consumers and a
//!   byte-budgeted LRU of idle resources
//! - A journaled disk cache behind the [`DiskCache`] trait
//! - Worker pools split by I/O class, with a network-free disk pool
//!
//! # Overview
//!
//! Applications implement [`DecodePipeline`] to fetch and decode sources.
//! The engine schedules it and hands results out as [`ResourceHandle`]s;
//! dropping the last handle moves the resource into the memory cache.
//!
//! ```no_run
//! use pictor_engine::{
//!     BytesResource, DataSource, DecodeContext, DecodePipeline, DecodeRequest, Decoded,
//!     Engine, EngineConfig, LoadError, LoadRequest, Model, RequestKey,
//! };
//!
//! struct ReadFile;
//!
//! impl DecodePipeline for ReadFile {
//!     fn decode_source(
//!         &self,
//!         request: &DecodeRequest,
//!         _context: &DecodeContext,
//!     ) -> Result<Decoded, LoadError> {
//!         let Model::File(path) = request.key().model() else {
//!             return Err(LoadError::no_result(request.key().to_string()));
//!         };
//!         let bytes = std::fs::read(path)
//!             .map_err(|e| LoadError::from_error(request.key().to_string(), &e))?;
//!         Ok(Decoded::new(BytesResource::new(bytes), DataSource::Local))
//!     }
//! }
//!
//! # fn main() -> miette::Result<()> {
//! let engine = Engine::from_config(EngineConfig::default(), ReadFile)?.spawn()?;
//! let key = RequestKey::builder(Model::File("cat.png".into())).build();
//! let loaded = engine.get_blocking(LoadRequest::new(key))?;
//! println!("{} bytes from {}", loaded.resource.size(), loaded.source);
//! drop(loaded);
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

#![expect(
    clippy::missing_errors_doc,
    reason = "Fallible operations return the crate error types, documented on the types"
)]

mod active;
mod arena;
pub mod buffer;
pub mod config;
pub mod disk;
pub mod engine;
mod error;
pub mod executor;
pub mod job;
pub mod key;
pub mod memory;
pub mod pipeline;
pub mod resource;

// Re-export error types at crate root
pub use error::{EngineError, LoadError, Result};

// Re-export main types
pub use buffer::BufferPool;
pub use config::{DiskCacheConfig, EngineConfig, PoolsConfig};
pub use disk::{
    DiskCache, DiskCacheStrategy, DiskKey, DiskLruCacheWrapper, EncodeStrategy, NoDiskCache,
};
pub use engine::{
    Engine, EngineBuilder, EngineHandle, EngineStats, LoadHandle, LoadRequest, Loaded,
};
pub use executor::{
    Executor, ExecutorBuilder, Executors, NetworkPolicy, PanicPolicy, Priority,
    assert_network_permitted, best_thread_count, network_permitted,
};
pub use job::{IoClass, JobState};
pub use key::{
    CacheKeyContribution, Model, OptionKey, OptionType, OptionValue, Options, RequestKey,
    RequestKeyBuilder, ResourceType, SIZE_ORIGINAL, Signature, TransformationKey,
};
pub use memory::{EvictionListener, MemoryCache, TrimLevel};
pub use pipeline::{DecodeContext, DecodePipeline, DecodeRequest, Decoded};
pub use resource::{
    BytesResource, DataSource, EngineResource, Released, Resource, ResourceHandle, ResourceId,
};
