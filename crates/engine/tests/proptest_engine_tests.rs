//! Property-based tests for engine bookkeeping
//!
//! - Refcounts: random acquire/release interleavings keep the active set, the
//!   arena and the memory cache consistent with a plain holder model, and
//!   every resource is recycled once, only after its last holder lets go
//! - Keys: disk digests are deterministic and separate decode parameters from
//!   source identity

#![allow(clippy::unwrap_used, clippy::expect_used)]

use parking_lot::Mutex;
use pictor_engine::{
    DataSource, DecodeContext, DecodePipeline, DecodeRequest, Decoded, DiskCacheStrategy, Engine,
    EngineConfig, Executors, LoadError, LoadRequest, Loaded, Model, NoDiskCache, RequestKey,
    Resource, TransformationKey,
};
use proptest::prelude::*;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Decodes 8-byte resources and counts recycles per request key
#[derive(Clone, Default)]
struct Counting {
    calls: Arc<AtomicUsize>,
    recycled: Arc<Mutex<HashMap<String, usize>>>,
}

impl Counting {
    fn recycled(&self, key: u8) -> usize {
        let name = request(key, true).key.to_string();
        self.recycled.lock().get(&name).copied().unwrap_or(0)
    }

    fn total_recycled(&self) -> usize {
        self.recycled.lock().values().sum()
    }
}

impl DecodePipeline for Counting {
    fn decode_source(
        &self,
        request: &DecodeRequest,
        _context: &DecodeContext,
    ) -> Result<Decoded, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Decoded::new(
            Counted {
                key: request.key().to_string(),
                bytes: vec![0; RESOURCE_BYTES],
                recycled: Arc::clone(&self.recycled),
            },
            DataSource::Remote,
        ))
    }
}

struct Counted {
    key: String,
    bytes: Vec<u8>,
    recycled: Arc<Mutex<HashMap<String, usize>>>,
}

impl Resource for Counted {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn recycle(self: Box<Self>) {
        *self.recycled.lock().entry(self.key).or_default() += 1;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

const RESOURCE_BYTES: usize = 8;
const MEMORY_SLOTS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Load { key: u8, cacheable: bool },
    Release { index: usize },
}

/// A delivered resource as the model tracks it
struct Holder {
    key: u8,
    cacheable: bool,
    loaded: Loaded,
}

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..5).prop_map(|key| Op::Load { key, cacheable: true }),
        1 => (0u8..5).prop_map(|key| Op::Load { key, cacheable: false }),
        4 => any::<usize>().prop_map(|index| Op::Release { index }),
    ]
}

fn request(key: u8, cacheable: bool) -> LoadRequest {
    let key = RequestKey::builder(Model::Asset(format!("asset-{key}"))).build();
    LoadRequest::new(key)
        .disk_strategy(DiskCacheStrategy::None)
        .memory_cacheable(cacheable)
}

fn load(engine: &mut Engine, key: u8, cacheable: bool) -> Loaded {
    let slot = Arc::new(Mutex::new(None));
    let callback_slot = Arc::clone(&slot);
    engine.load(request(key, cacheable), move |result| {
        *callback_slot.lock() = Some(result);
    });
    engine.run_pending();
    let result = slot.lock().take();
    result.unwrap().unwrap()
}

fn holds_cacheable(held: &[Holder], key: u8) -> bool {
    held.iter().any(|h| h.cacheable && h.key == key)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_refcounts_track_holders(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let pipeline = Counting::default();
        let mut engine = Engine::builder(pipeline.clone())
            .config(EngineConfig {
                memory_cache_bytes: MEMORY_SLOTS * RESOURCE_BYTES,
                ..EngineConfig::default()
            })
            .executors(Executors::direct())
            .disk_cache(Arc::new(NoDiskCache))
            .build()
            .unwrap();

        let mut held: Vec<Holder> = Vec::new();
        // Released cacheable keys, least recently used first
        let mut idle: VecDeque<u8> = VecDeque::new();
        let mut expected_recycled: HashMap<u8, usize> = HashMap::new();
        let mut expected_calls = 0;

        for op in ops {
            let before: Vec<(u8, usize)> =
                (0u8..5).map(|key| (key, pipeline.recycled(key))).collect();
            let mut released_uncached = None;

            match op {
                Op::Load { key, cacheable } => {
                    let active = cacheable && holds_cacheable(&held, key);
                    let cached = cacheable && !active && idle.contains(&key);
                    if cached {
                        idle.retain(|k| *k != key);
                    }
                    let loaded = load(&mut engine, key, cacheable);
                    if active || cached {
                        prop_assert_eq!(loaded.source, DataSource::MemoryCache);
                    } else {
                        expected_calls += 1;
                        prop_assert_eq!(loaded.source, DataSource::Remote);
                    }
                    if active {
                        let other = held.iter().find(|h| h.cacheable && h.key == key).unwrap();
                        prop_assert_eq!(other.loaded.resource.id(), loaded.resource.id());
                    }
                    held.push(Holder { key, cacheable, loaded });
                }
                Op::Release { index } => {
                    if held.is_empty() {
                        continue;
                    }
                    let holder = held.remove(index % held.len());
                    let (key, cacheable) = (holder.key, holder.cacheable);
                    drop(holder);
                    engine.run_pending();
                    if !cacheable {
                        released_uncached = Some(key);
                        *expected_recycled.entry(key).or_default() += 1;
                    } else if !holds_cacheable(&held, key) {
                        idle.push_back(key);
                        if idle.len() > MEMORY_SLOTS
                            && let Some(evicted) = idle.pop_front()
                        {
                            *expected_recycled.entry(evicted).or_default() += 1;
                        }
                    }
                }
            }

            for (key, count) in before {
                if holds_cacheable(&held, key) && released_uncached != Some(key) {
                    prop_assert_eq!(pipeline.recycled(key), count, "recycled while held");
                }
                prop_assert_eq!(
                    pipeline.recycled(key),
                    expected_recycled.get(&key).copied().unwrap_or(0)
                );
            }

            let active: HashSet<u8> =
                held.iter().filter(|h| h.cacheable).map(|h| h.key).collect();
            let uncached = held.iter().filter(|h| !h.cacheable).count();
            let stats = engine.stats();
            prop_assert_eq!(stats.live_resources, active.len() + uncached);
            prop_assert_eq!(stats.active, active.len());
            prop_assert_eq!(stats.memory_entries, idle.len());
            prop_assert_eq!(stats.memory_bytes, idle.len() * RESOURCE_BYTES);
            prop_assert_eq!(stats.jobs, 0);
            prop_assert_eq!(pipeline.calls.load(Ordering::SeqCst), expected_calls);
        }

        // Every decoded resource is recycled exactly once in the end.
        held.clear();
        engine.run_pending();
        engine.clear_memory();
        prop_assert_eq!(engine.stats().live_resources, 0);
        prop_assert_eq!(pipeline.total_recycled(), expected_calls);
    }

    #[test]
    fn prop_disk_keys_are_deterministic(
        url in "[a-z]{1,12}",
        width in 1u32..4096,
        height in 1u32..4096,
        params in prop::collection::vec(any::<u8>(), 0..16),
    ) {
        let build = |width: u32| {
            RequestKey::builder(Model::Url(format!("https://example.com/{url}")))
                .size(width, height)
                .transform(TransformationKey::new("crop", params.clone()))
                .build()
        };
        let a = build(width);
        let b = build(width);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.resource_disk_key(), b.resource_disk_key());
        prop_assert_eq!(a.source_disk_key(), b.source_disk_key());

        let resized = build(width + 1);
        prop_assert_ne!(a.resource_disk_key(), resized.resource_disk_key());
        prop_assert_eq!(a.source_disk_key(), resized.source_disk_key());
    }
}
