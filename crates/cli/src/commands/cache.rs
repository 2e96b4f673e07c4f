//! `pictor cache` subcommands
//!
//! Every command opens the directory with the header already on disk so an
//! existing cache is never wiped by a parameter mismatch. Only `put` and
//! `trim` open with a real budget; the rest never evict.

use super::{Context, emit};
use crate::errors::CliError;
use pictor_engine::EngineConfig;
use pictor_journal::{DiskLruCache, Header};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Values per entry for caches created by the CLI, matching the engine
const DEFAULT_VALUE_COUNT: usize = 1;

/// Where a command operates and with which journal parameters
#[derive(Debug, Clone)]
pub struct CacheTarget {
    /// Cache directory
    pub directory: PathBuf,
    /// App version from the journal, or the configured one for a new cache
    pub app_version: u32,
    /// Values per entry recorded in the journal, if one exists
    pub value_count: Option<usize>,
    /// Configured size budget
    pub max_bytes: u64,
}

impl CacheTarget {
    /// Resolve the directory and parameters from global options
    pub fn resolve(context: &Context) -> Result<Self, CliError> {
        let config = match &context.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        let directory = match &context.dir {
            Some(dir) => dir.clone(),
            None => config.resolve_disk_cache_dir()?,
        };
        let header = Header::read(&directory)?;
        Ok(Self {
            app_version: header.map_or(config.disk_cache.app_version, |h| h.app_version),
            value_count: header.map(|h| h.value_count),
            max_bytes: config.disk_cache.max_bytes,
            directory,
        })
    }

    fn value_count(&self) -> usize {
        self.value_count.unwrap_or(DEFAULT_VALUE_COUNT)
    }

    fn open(&self, max_bytes: u64) -> Result<DiskLruCache, CliError> {
        Ok(DiskLruCache::open(
            &self.directory,
            self.app_version,
            self.value_count(),
            max_bytes,
        )?)
    }

    fn open_unbounded(&self) -> Result<DiskLruCache, CliError> {
        self.open(u64::MAX)
    }
}

// =============================================================================
// info
// =============================================================================

/// Result of `cache info`
#[derive(Debug, Clone, Serialize)]
pub struct InfoReport {
    /// Cache directory
    pub directory: PathBuf,
    /// Whether a journal was found
    pub exists: bool,
    /// App version of the journal
    pub app_version: u32,
    /// Values per entry
    pub value_count: usize,
    /// Indexed entries
    pub entries: usize,
    /// Bytes used by committed values
    pub size_bytes: u64,
    /// Configured budget
    pub max_bytes: u64,
}

impl fmt::Display for InfoReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "directory:   {}", self.directory.display())?;
        if !self.exists {
            return write!(f, "no cache journal found");
        }
        writeln!(f, "app version: {}", self.app_version)?;
        writeln!(f, "values:      {}", self.value_count)?;
        writeln!(f, "entries:     {}", self.entries)?;
        write!(f, "size:        {} / {} bytes", self.size_bytes, self.max_bytes)
    }
}

/// Report location and usage without creating a cache
pub fn info(target: &CacheTarget, json: bool, out: &mut impl Write) -> Result<(), CliError> {
    let mut report = InfoReport {
        directory: target.directory.clone(),
        exists: target.value_count.is_some(),
        app_version: target.app_version,
        value_count: target.value_count(),
        entries: 0,
        size_bytes: 0,
        max_bytes: target.max_bytes,
    };
    if report.exists {
        let cache = target.open_unbounded()?;
        report.entries = cache.len();
        report.size_bytes = cache.size();
        cache.close()?;
    }
    emit(out, json, &report)
}

// =============================================================================
// get
// =============================================================================

/// Result of `cache get` when the value is not streamed raw
#[derive(Debug, Clone, Serialize)]
pub struct GetReport {
    /// Entry key
    pub key: String,
    /// Value index
    pub index: usize,
    /// Value length in bytes
    pub length: u64,
    /// File the value was written to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written_to: Option<PathBuf>,
}

impl fmt::Display for GetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: {} bytes", self.key, self.index, self.length)?;
        if let Some(path) = &self.written_to {
            write!(f, " written to {}", path.display())?;
        }
        Ok(())
    }
}

/// Read one value of an entry
///
/// Without `dest` the raw bytes go to `out` in text mode; JSON mode only
/// reports the length.
pub fn get(
    target: &CacheTarget,
    key: &str,
    index: usize,
    dest: Option<&Path>,
    json: bool,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let cache = target.open_unbounded()?;
    if index >= cache.value_count() {
        return Err(CliError::config_with_help(
            format!("value index {index} is out of range"),
            format!("this cache stores {} value(s) per entry", cache.value_count()),
        ));
    }
    let Some(snapshot) = cache.get(key)? else {
        cache.close()?;
        return Err(CliError::NotFound {
            key: key.to_string(),
        });
    };
    let data = snapshot.read(index)?;
    cache.close()?;
    tracing::debug!(key, index, length = data.len(), "Read cache value");

    let report = GetReport {
        key: key.to_string(),
        index,
        length: snapshot.length(index),
        written_to: dest.map(Path::to_path_buf),
    };
    if let Some(path) = dest {
        std::fs::write(path, &data).map_err(|e| CliError::file("write", path, e))?;
        emit(out, json, &report)
    } else if json {
        emit(out, json, &report)
    } else {
        out.write_all(&data).map_err(CliError::output)
    }
}

// =============================================================================
// put
// =============================================================================

/// Result of `cache put`
#[derive(Debug, Clone, Serialize)]
pub struct PutReport {
    /// Entry key
    pub key: String,
    /// Length of each stored value
    pub lengths: Vec<u64>,
    /// Cache size after the commit
    pub size_bytes: u64,
}

impl fmt::Display for PutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total: u64 = self.lengths.iter().sum();
        write!(
            f,
            "stored {} ({} bytes in {} value(s))",
            self.key,
            total,
            self.lengths.len()
        )
    }
}

/// Store one file per value under `key`
pub fn put(
    target: &CacheTarget,
    key: &str,
    files: &[PathBuf],
    json: bool,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let expected = target.value_count();
    if files.len() != expected {
        return Err(CliError::config_with_help(
            format!("expected {expected} file(s), got {}", files.len()),
            "pass one file per value the cache stores",
        ));
    }
    let values = files
        .iter()
        .map(|path| std::fs::read(path).map_err(|e| CliError::file("read", path, e)))
        .collect::<Result<Vec<_>, _>>()?;

    let cache = target.open(target.max_bytes)?;
    let Some(mut editor) = cache.edit(key)? else {
        cache.close()?;
        return Err(CliError::Busy {
            key: key.to_string(),
        });
    };
    for (index, value) in values.iter().enumerate() {
        editor.set(index, value)?;
    }
    editor.commit()?;
    cache.flush()?;

    let report = PutReport {
        key: key.to_string(),
        lengths: values.iter().map(|v| v.len() as u64).collect(),
        size_bytes: cache.size(),
    };
    cache.close()?;
    tracing::debug!(key, size = report.size_bytes, "Stored cache entry");
    emit(out, json, &report)
}

// =============================================================================
// remove
// =============================================================================

/// Result of `cache remove`
#[derive(Debug, Clone, Serialize)]
pub struct RemoveReport {
    /// Entry key
    pub key: String,
    /// Whether an entry was dropped
    pub removed: bool,
}

impl fmt::Display for RemoveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.removed {
            write!(f, "removed {}", self.key)
        } else {
            write!(f, "{} not present", self.key)
        }
    }
}

/// Drop the entry for `key`
pub fn remove(
    target: &CacheTarget,
    key: &str,
    json: bool,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let cache = target.open_unbounded()?;
    let removed = cache.remove(key)?;
    cache.close()?;
    emit(
        out,
        json,
        &RemoveReport {
            key: key.to_string(),
            removed,
        },
    )
}

// =============================================================================
// trim
// =============================================================================

/// Result of `cache trim`
#[derive(Debug, Clone, Serialize)]
pub struct TrimReport {
    /// Entries evicted
    pub evicted: usize,
    /// Size before trimming
    pub size_before: u64,
    /// Size after trimming
    pub size_after: u64,
    /// Budget trimmed to
    pub max_bytes: u64,
}

impl fmt::Display for TrimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "evicted {} entries, {} -> {} bytes (budget {})",
            self.evicted, self.size_before, self.size_after, self.max_bytes
        )
    }
}

/// Evict least recently used entries down to `max_bytes`
pub fn trim(
    target: &CacheTarget,
    max_bytes: u64,
    json: bool,
    out: &mut impl Write,
) -> Result<(), CliError> {
    if max_bytes == 0 {
        return Err(CliError::config_with_help(
            "--max-bytes must be greater than zero",
            "use `pictor cache clear` to drop every entry",
        ));
    }
    let cache = target.open_unbounded()?;
    let entries_before = cache.len();
    let size_before = cache.size();
    cache.set_max_size(max_bytes);
    cache.flush()?;
    let report = TrimReport {
        evicted: entries_before.saturating_sub(cache.len()),
        size_before,
        size_after: cache.size(),
        max_bytes,
    };
    cache.close()?;
    tracing::debug!(evicted = report.evicted, "Trimmed disk cache");
    emit(out, json, &report)
}

// =============================================================================
// clear
// =============================================================================

/// Result of `cache clear`
#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    /// Directory that was removed
    pub directory: PathBuf,
    /// Entries dropped
    pub entries: usize,
    /// Bytes freed
    pub bytes: u64,
}

impl fmt::Display for ClearReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cleared {} entries ({} bytes) from {}",
            self.entries,
            self.bytes,
            self.directory.display()
        )
    }
}

/// Delete the cache directory and everything in it
pub fn clear(target: &CacheTarget, json: bool, out: &mut impl Write) -> Result<(), CliError> {
    let mut report = ClearReport {
        directory: target.directory.clone(),
        entries: 0,
        bytes: 0,
    };
    if target.value_count.is_some() {
        let cache = target.open_unbounded()?;
        report.entries = cache.len();
        report.bytes = cache.size();
        cache.delete()?;
    } else if target.directory.exists() {
        std::fs::remove_dir_all(&target.directory)
            .map_err(|e| CliError::file("remove", &target.directory, e))?;
    }
    tracing::debug!(entries = report.entries, "Cleared disk cache");
    emit(out, json, &report)
}
