//! Engine-facing disk cache adapter
//!
//! The engine talks to persistent storage only through [`DiskCache`]. The
//! default implementation wraps a [`DiskLruCache`] that is opened lazily on
//! first use, keeps a single value file per entry and serialises concurrent
//! writers of the same key.

use crate::resource::DataSource;
use parking_lot::Mutex;
use pictor_journal::DiskLruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lowercase hex digest naming a disk cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskKey(String);

impl DiskKey {
    pub(crate) fn from_digest(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// The digest as a journal-safe string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persistent cache consulted by decode pipelines
///
/// Implementations never surface errors: failures are logged and reported as
/// misses so a broken disk only costs a refetch.
pub trait DiskCache: Send + Sync {
    /// Path of the cached file for `key`, if present
    fn get(&self, key: &DiskKey) -> Option<PathBuf>;

    /// Write an entry through `writer`, which fills the given path and
    /// returns `true` to commit
    fn put(&self, key: &DiskKey, writer: &mut dyn FnMut(&Path) -> bool);

    /// Remove the entry for `key`
    fn delete(&self, key: &DiskKey);

    /// Remove every entry
    fn clear(&self);
}

/// Disk cache that stores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiskCache;

impl DiskCache for NoDiskCache {
    fn get(&self, _key: &DiskKey) -> Option<PathBuf> {
        None
    }

    fn put(&self, _key: &DiskKey, _writer: &mut dyn FnMut(&Path) -> bool) {}

    fn delete(&self, _key: &DiskKey) {}

    fn clear(&self) {}
}

/// [`DiskCache`] backed by a journaled [`DiskLruCache`]
pub struct DiskLruCacheWrapper {
    directory: PathBuf,
    max_size: u64,
    app_version: u32,
    cache: Mutex<Option<DiskLruCache>>,
    locker: WriteLocker,
}

impl DiskLruCacheWrapper {
    /// Create a wrapper; the directory is not touched until first use
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, max_size: u64, app_version: u32) -> Self {
        Self {
            directory: directory.into(),
            max_size,
            app_version,
            cache: Mutex::new(None),
            locker: WriteLocker::default(),
        }
    }

    /// Directory holding the journal and value files
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Bytes currently stored, or zero if the cache cannot be opened
    #[must_use]
    pub fn size(&self) -> u64 {
        self.disk_cache().as_ref().map_or(0, DiskLruCache::size)
    }

    fn disk_cache(&self) -> pictor_journal::Result<DiskLruCache> {
        let mut slot = self.cache.lock();
        if let Some(cache) = slot.as_ref().filter(|cache| !cache.is_closed()) {
            return Ok(cache.clone());
        }
        let cache = DiskLruCache::open(&self.directory, self.app_version, 1, self.max_size)?;
        *slot = Some(cache.clone());
        Ok(cache)
    }

    fn write(&self, key: &DiskKey, writer: &mut dyn FnMut(&Path) -> bool) {
        let cache = match self.disk_cache() {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!(target: "pictor::engine", error = %e, "Unable to open disk cache");
                return;
            }
        };
        match cache.get(key.as_str()) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(target: "pictor::engine", key = %key, error = %e, "Disk cache lookup failed before put");
                return;
            }
        }
        let mut editor = match cache.edit(key.as_str()) {
            Ok(Some(editor)) => editor,
            Ok(None) => {
                tracing::warn!(target: "pictor::engine", key = %key, "Entry is already being written");
                return;
            }
            Err(e) => {
                tracing::warn!(target: "pictor::engine", key = %key, error = %e, "Unable to edit disk cache entry");
                return;
            }
        };
        let file = match editor.file(0) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(target: "pictor::engine", key = %key, error = %e, "Unable to prepare disk cache file");
                return;
            }
        };
        if writer(&file)
            && let Err(e) = editor.commit()
        {
            tracing::warn!(target: "pictor::engine", key = %key, error = %e, "Unable to commit disk cache entry");
        }
    }
}

impl fmt::Debug for DiskLruCacheWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskLruCacheWrapper")
            .field("directory", &self.directory)
            .field("max_size", &self.max_size)
            .field("app_version", &self.app_version)
            .finish_non_exhaustive()
    }
}

impl DiskCache for DiskLruCacheWrapper {
    fn get(&self, key: &DiskKey) -> Option<PathBuf> {
        let result = self
            .disk_cache()
            .and_then(|cache| cache.get(key.as_str()));
        match result {
            Ok(snapshot) => snapshot.map(|snapshot| snapshot.file(0).to_path_buf()),
            Err(e) => {
                tracing::warn!(target: "pictor::engine", key = %key, error = %e, "Unable to read disk cache");
                None
            }
        }
    }

    fn put(&self, key: &DiskKey, writer: &mut dyn FnMut(&Path) -> bool) {
        self.locker.with_lock(key.as_str(), || self.write(key, writer));
    }

    fn delete(&self, key: &DiskKey) {
        let result = self
            .disk_cache()
            .and_then(|cache| cache.remove(key.as_str()));
        if let Err(e) = result {
            tracing::warn!(target: "pictor::engine", key = %key, error = %e, "Unable to delete from disk cache");
        }
    }

    fn clear(&self) {
        let mut slot = self.cache.lock();
        let cache = match slot.take() {
            Some(cache) => Ok(cache),
            None => DiskLruCache::open(&self.directory, self.app_version, 1, self.max_size),
        };
        match cache.and_then(|cache| cache.delete()) {
            Ok(()) => tracing::info!(target: "pictor::engine", directory = %self.directory.display(), "Cleared disk cache"),
            Err(e) => tracing::warn!(target: "pictor::engine", error = %e, "Unable to clear disk cache"),
        }
    }
}

/// Per-key mutual exclusion for disk writers
///
/// Locks are reference counted so the map only holds keys with a writer
/// waiting or running.
#[derive(Default)]
struct WriteLocker {
    locks: Mutex<HashMap<String, WriteLock>>,
}

struct WriteLock {
    lock: Arc<Mutex<()>>,
    interested: usize,
}

struct Interest<'a> {
    locker: &'a WriteLocker,
    key: &'a str,
}

impl Drop for Interest<'_> {
    fn drop(&mut self) {
        let mut locks = self.locker.locks.lock();
        if let Some(entry) = locks.get_mut(self.key) {
            entry.interested -= 1;
            if entry.interested == 0 {
                locks.remove(self.key);
            }
        }
    }
}

impl WriteLocker {
    fn with_lock<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut locks = self.locks.lock();
            let entry = locks.entry(key.to_string()).or_insert_with(|| WriteLock {
                lock: Arc::default(),
                interested: 0,
            });
            entry.interested += 1;
            Arc::clone(&entry.lock)
        };
        let _interest = Interest { locker: self, key };
        let _guard = lock.lock();
        f()
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

/// What a load may read from and write to the disk cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskCacheStrategy {
    /// Cache remote source data and transformed resources
    All,
    /// Never touch the disk cache
    None,
    /// Cache source data only
    Data,
    /// Cache transformed resources only
    Resource,
    /// Cache remote data and locally decoded transformed resources
    #[default]
    Automatic,
}

/// How a decoded resource would be encoded for the disk cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodeStrategy {
    /// The unmodified source bytes
    Source,
    /// The transformed resource
    Transformed,
    /// Nothing is written
    None,
}

impl DiskCacheStrategy {
    /// Whether source data obtained from `source` should be written
    #[must_use]
    pub fn is_data_cacheable(self, source: DataSource) -> bool {
        match self {
            Self::All | Self::Automatic => source == DataSource::Remote,
            Self::Data => {
                source != DataSource::DataDiskCache && source != DataSource::MemoryCache
            }
            Self::None | Self::Resource => false,
        }
    }

    /// Whether a transformed resource should be written
    #[must_use]
    pub fn is_resource_cacheable(
        self,
        from_alternate_key: bool,
        source: DataSource,
        encode: EncodeStrategy,
    ) -> bool {
        match self {
            Self::All | Self::Resource => {
                source != DataSource::ResourceDiskCache && source != DataSource::MemoryCache
            }
            Self::Automatic => {
                ((from_alternate_key && source == DataSource::DataDiskCache)
                    || source == DataSource::Local)
                    && encode == EncodeStrategy::Transformed
            }
            Self::None | Self::Data => false,
        }
    }

    /// Whether cached transformed resources may be decoded
    #[must_use]
    pub const fn decode_cached_resource(self) -> bool {
        matches!(self, Self::All | Self::Resource | Self::Automatic)
    }

    /// Whether cached source data may be decoded
    #[must_use]
    pub const fn decode_cached_data(self) -> bool {
        matches!(self, Self::All | Self::Data | Self::Automatic)
    }

    /// Whether a load should consult the disk cache before the source
    #[must_use]
    pub const fn reads_disk_cache(self) -> bool {
        self.decode_cached_resource() || self.decode_cached_data()
    }
}
