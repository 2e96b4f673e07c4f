//! Byte-budgeted recent-use cache of idle resources
//!
//! Resources land here when their last consumer lets go and leave again when
//! a load claims them or when the budget forces them out. Evicted resources
//! are handed to a listener which recycles them by default.

use crate::error::{EngineError, Result};
use crate::key::RequestKey;
use crate::resource::EngineResource;
use lru::LruCache;
use std::fmt;

/// Callback receiving every resource pushed out of the cache
pub type EvictionListener = Box<dyn FnMut(RequestKey, EngineResource) + Send>;

/// Memory pressure levels reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrimLevel {
    /// Running, memory getting low
    RunningModerate = 5,
    /// Running, memory low
    RunningLow = 10,
    /// Running, memory critically low
    RunningCritical = 15,
    /// The interface is no longer visible
    UiHidden = 20,
    /// In the background list
    Background = 40,
    /// In the middle of the background list
    Moderate = 60,
    /// Next in line to be killed
    Complete = 80,
}

struct Entry {
    size: usize,
    resource: EngineResource,
}

/// LRU cache bounded by the summed size of its resources
pub struct MemoryCache {
    entries: LruCache<RequestKey, Entry>,
    initial_max_size: usize,
    max_size: usize,
    current_size: usize,
    listener: EvictionListener,
}

impl MemoryCache {
    /// Create a cache holding at most `max_size` bytes
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            initial_max_size: max_size,
            max_size,
            current_size: 0,
            listener: Box::new(|_, resource| resource.recycle()),
        }
    }

    /// Replace the eviction listener
    pub fn set_eviction_listener(
        &mut self,
        listener: impl FnMut(RequestKey, EngineResource) + Send + 'static,
    ) {
        self.listener = Box::new(listener);
    }

    /// Current budget in bytes
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bytes held
    #[must_use]
    pub const fn current_size(&self) -> usize {
        self.current_size
    }

    /// Number of cached resources
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `key` is cached, without touching its recency
    #[must_use]
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.entries.contains(key)
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> impl Iterator<Item = &RequestKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    /// Scale the budget relative to the size the cache was created with
    pub fn set_size_multiplier(&mut self, multiplier: f64) -> Result<()> {
        if multiplier.is_nan() || multiplier < 0.0 {
            return Err(EngineError::configuration(format!(
                "memory cache size multiplier must be non-negative, got {multiplier}"
            )));
        }
        #[expect(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "cache budgets are far below the f64 mantissa and the product is non-negative"
        )]
        let max_size = (self.initial_max_size as f64 * multiplier).round() as usize;
        self.max_size = max_size;
        self.evict();
        Ok(())
    }

    /// Insert an idle resource as the most recently used entry
    ///
    /// A resource that alone meets the budget is evicted straight away; a
    /// resource already cached under `key` is replaced and evicted.
    pub fn put(&mut self, key: RequestKey, resource: EngineResource) {
        let size = resource.size();
        if size >= self.max_size {
            tracing::trace!(target: "pictor::engine", key = %key, size, max = self.max_size, "Resource exceeds memory budget");
            (self.listener)(key, resource);
            return;
        }
        self.current_size += size;
        if let Some((old_key, old)) = self.entries.push(key, Entry { size, resource }) {
            self.current_size -= old.size;
            (self.listener)(old_key, old.resource);
        }
        self.evict();
    }

    /// Mark `key` as recently used and borrow its resource
    pub fn get(&mut self, key: &RequestKey) -> Option<&EngineResource> {
        self.entries.get(key).map(|entry| &entry.resource)
    }

    /// Take the resource for `key` out without notifying the listener
    pub fn remove(&mut self, key: &RequestKey) -> Option<EngineResource> {
        let entry = self.entries.pop(key)?;
        self.current_size -= entry.size;
        Some(entry.resource)
    }

    /// Evict least recently used entries until at most `size` bytes remain
    pub fn trim_to_size(&mut self, size: usize) {
        while self.current_size > size {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.current_size -= entry.size;
            (self.listener)(key, entry.resource);
        }
    }

    /// Evict everything
    pub fn clear_memory(&mut self) {
        self.trim_to_size(0);
    }

    /// Shed memory according to host pressure
    pub fn trim_memory(&mut self, level: TrimLevel) {
        if level >= TrimLevel::Background {
            self.clear_memory();
        } else if level >= TrimLevel::UiHidden || level == TrimLevel::RunningCritical {
            self.trim_to_size(self.max_size / 2);
        }
    }

    fn evict(&mut self) {
        self.trim_to_size(self.max_size);
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.len())
            .field("max_size", &self.max_size)
            .field("current_size", &self.current_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Model;
    use crate::resource::BytesResource;
    use std::sync::{Arc, Mutex};

    fn key(name: &str) -> RequestKey {
        RequestKey::builder(Model::Asset(name.to_string())).build()
    }

    fn resource(name: &str, size: usize) -> EngineResource {
        EngineResource::new(key(name), Box::new(BytesResource::new(vec![0; size])), true)
    }

    fn recording(cache: &mut MemoryCache) -> Arc<Mutex<Vec<String>>> {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        cache.set_eviction_listener(move |key, resource| {
            if let Model::Asset(name) = key.model() {
                sink.lock().unwrap().push(name.clone());
            }
            resource.recycle();
        });
        evicted
    }

    // ==========================================================================
    // Budget and order
    // ==========================================================================

    #[test]
    fn test_evicts_least_recently_used_first() {
        let mut cache = MemoryCache::new(30);
        let evicted = recording(&mut cache);
        cache.put(key("a"), resource("a", 10));
        cache.put(key("b"), resource("b", 10));
        cache.put(key("c"), resource("c", 10));
        assert!(cache.get(&key("a")).is_some());

        cache.put(key("d"), resource("d", 10));
        assert_eq!(*evicted.lock().unwrap(), vec!["b".to_string()]);
        assert_eq!(cache.current_size(), 30);
        let keys: Vec<_> = cache.keys().cloned().collect();
        assert_eq!(keys, vec![key("d"), key("a"), key("c")]);
    }

    #[test]
    fn test_oversized_resource_is_evicted_immediately() {
        let mut cache = MemoryCache::new(10);
        let evicted = recording(&mut cache);
        cache.put(key("big"), resource("big", 10));
        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
        assert_eq!(*evicted.lock().unwrap(), vec!["big".to_string()]);
    }

    #[test]
    fn test_replaced_value_is_evicted() {
        let mut cache = MemoryCache::new(100);
        let evicted = recording(&mut cache);
        cache.put(key("a"), resource("a", 10));
        cache.put(key("a"), resource("a", 20));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 20);
        assert_eq!(*evicted.lock().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_remove_skips_listener() {
        let mut cache = MemoryCache::new(100);
        let evicted = recording(&mut cache);
        cache.put(key("a"), resource("a", 10));
        let removed = cache.remove(&key("a")).unwrap();
        assert_eq!(removed.size(), 10);
        assert_eq!(cache.current_size(), 0);
        assert!(evicted.lock().unwrap().is_empty());
        removed.recycle();
    }

    // ==========================================================================
    // Resizing and memory pressure
    // ==========================================================================

    #[test]
    fn test_size_multiplier() {
        let mut cache = MemoryCache::new(100);
        let evicted = recording(&mut cache);
        for name in ["a", "b", "c", "d"] {
            cache.put(key(name), resource(name, 20));
        }
        cache.set_size_multiplier(0.5).unwrap();
        assert_eq!(cache.max_size(), 50);
        assert_eq!(cache.current_size(), 40);
        assert_eq!(*evicted.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);

        cache.set_size_multiplier(2.0).unwrap();
        assert_eq!(cache.max_size(), 200);
    }

    #[test]
    fn test_negative_multiplier_is_rejected() {
        let mut cache = MemoryCache::new(100);
        assert!(cache.set_size_multiplier(-1.0).is_err());
        assert!(cache.set_size_multiplier(f64::NAN).is_err());
        assert_eq!(cache.max_size(), 100);
    }

    #[test]
    fn test_trim_levels() {
        let fill = |cache: &mut MemoryCache| {
            cache.clear_memory();
            for name in ["a", "b", "c", "d"] {
                cache.put(key(name), resource(name, 20));
            }
        };
        let mut cache = MemoryCache::new(100);

        fill(&mut cache);
        cache.trim_memory(TrimLevel::RunningLow);
        assert_eq!(cache.current_size(), 80);

        fill(&mut cache);
        cache.trim_memory(TrimLevel::RunningCritical);
        assert_eq!(cache.current_size(), 40);

        fill(&mut cache);
        cache.trim_memory(TrimLevel::UiHidden);
        assert_eq!(cache.current_size(), 40);

        fill(&mut cache);
        cache.trim_memory(TrimLevel::Background);
        assert!(cache.is_empty());

        fill(&mut cache);
        cache.trim_memory(TrimLevel::Complete);
        assert_eq!(cache.current_size(), 0);
    }
}
