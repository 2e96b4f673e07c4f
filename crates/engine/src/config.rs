//! Engine configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! memory_cache_bytes = 33554432
//!
//! [disk_cache]
//! directory = "/var/cache/pictor"
//! max_bytes = 262144000
//!
//! [pools]
//! source_threads = 4
//! panic_policy = "propagate"
//! ```

use crate::error::{EngineError, Result};
use crate::executor::PanicPolicy;
use dirs::{cache_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the disk cache directory inside a cache root
pub const DEFAULT_DISK_CACHE_DIR: &str = "image_manager_disk_cache";

/// Environment variable overriding the disk cache directory
pub const CACHE_DIR_ENV: &str = "PICTOR_CACHE_DIR";

const MIB: usize = 1024 * 1024;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Budget of the memory cache in bytes
    pub memory_cache_bytes: usize,
    /// Budget of the buffer pool in bytes
    pub buffer_pool_bytes: usize,
    /// Persistent cache settings
    pub disk_cache: DiskCacheConfig,
    /// Worker pool settings
    pub pools: PoolsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_cache_bytes: 32 * MIB,
            buffer_pool_bytes: 4 * MIB,
            disk_cache: DiskCacheConfig::default(),
            pools: PoolsConfig::default(),
        }
    }
}

/// Persistent cache settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DiskCacheConfig {
    /// Whether loads may use the disk cache at all
    pub enabled: bool,
    /// Cache directory; resolved from the environment when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// Budget in bytes
    pub max_bytes: u64,
    /// Version stamped into the journal; changing it discards the cache
    pub app_version: u32,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            max_bytes: 250 * 1024 * 1024,
            app_version: 1,
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolsConfig {
    /// Threads reading the disk cache
    pub disk_threads: usize,
    /// Threads of the bounded source pool; sized from the CPU count when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_threads: Option<usize>,
    /// Idle lifetime of unbounded pool threads in milliseconds
    pub unlimited_keep_alive_ms: u64,
    /// Handling of panicking tasks
    pub panic_policy: PanicPolicy,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            disk_threads: 1,
            source_threads: None,
            unlimited_keep_alive_ms: 10_000,
            panic_policy: PanicPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| EngineError::configuration(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::io(e, path, "read engine config"))?;
        tracing::debug!(target: "pictor::engine", path = %path.display(), "Loaded engine config");
        Self::from_toml_str(&text)
    }

    /// Reject values no engine can run with
    pub fn validate(&self) -> Result<()> {
        if self.pools.disk_threads == 0 {
            return Err(EngineError::configuration(
                "pools.disk_threads must be at least 1",
            ));
        }
        if self.pools.source_threads == Some(0) {
            return Err(EngineError::configuration(
                "pools.source_threads must be at least 1",
            ));
        }
        Ok(())
    }

    /// Directory the disk cache should live in
    ///
    /// Resolution order (first writable wins):
    /// 1. `disk_cache.directory`
    /// 2. `PICTOR_CACHE_DIR`
    /// 3. `XDG_CACHE_HOME/pictor/image_manager_disk_cache`
    /// 4. OS cache dir `/pictor/image_manager_disk_cache`
    /// 5. `~/.pictor/cache/image_manager_disk_cache`
    /// 6. temp dir `/pictor/image_manager_disk_cache`
    pub fn resolve_disk_cache_dir(&self) -> Result<PathBuf> {
        cache_dir_from_inputs(CacheDirInputs {
            configured: self.disk_cache.directory.clone(),
            env_override: env_path(CACHE_DIR_ENV),
            xdg_cache_home: env_path("XDG_CACHE_HOME"),
            os_cache_dir: cache_dir(),
            home_dir: home_dir(),
            temp_dir: std::env::temp_dir(),
        })
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone)]
struct CacheDirInputs {
    configured: Option<PathBuf>,
    env_override: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_dir_from_inputs(inputs: CacheDirInputs) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = inputs.configured.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(dir) = inputs.env_override {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("pictor").join(DEFAULT_DISK_CACHE_DIR));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("pictor").join(DEFAULT_DISK_CACHE_DIR));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".pictor/cache").join(DEFAULT_DISK_CACHE_DIR));
    }
    candidates.push(inputs.temp_dir.join("pictor").join(DEFAULT_DISK_CACHE_DIR));

    for path in candidates {
        if path.starts_with("/homeless-shelter") {
            continue;
        }
        // Existing directories may be read-only, so try a write.
        if path.exists() {
            let marker = path.join(".write_check");
            if std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&marker)
                .is_ok()
            {
                let _ = std::fs::remove_file(&marker);
                return Ok(path);
            }
            continue;
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(EngineError::configuration(
        "Failed to determine a writable disk cache directory",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn inputs(temp: &Path) -> CacheDirInputs {
        CacheDirInputs {
            configured: None,
            env_override: None,
            xdg_cache_home: None,
            os_cache_dir: None,
            home_dir: None,
            temp_dir: temp.to_path_buf(),
        }
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.memory_cache_bytes, 32 * MIB);
        assert_eq!(config.disk_cache.max_bytes, 250 * 1024 * 1024);
        assert_eq!(config.pools.unlimited_keep_alive_ms, 10_000);
        assert_eq!(config.pools.panic_policy, PanicPolicy::Log);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = EngineConfig::from_toml_str(
            r#"
            memory_cache_bytes = 1024

            [disk_cache]
            enabled = false
            directory = "/tmp/pictor-test"

            [pools]
            source_threads = 2
            panic_policy = "propagate"
            "#,
        )
        .unwrap();
        assert_eq!(config.memory_cache_bytes, 1024);
        assert!(!config.disk_cache.enabled);
        assert_eq!(
            config.disk_cache.directory.as_deref(),
            Some(Path::new("/tmp/pictor-test"))
        );
        assert_eq!(config.disk_cache.app_version, 1);
        assert_eq!(config.pools.source_threads, Some(2));
        assert_eq!(config.pools.panic_policy, PanicPolicy::Propagate);
        assert_eq!(config.pools.disk_threads, 1);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = EngineConfig::from_toml_str("memory_cache = 5").unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[test]
    fn test_zero_threads_are_rejected() {
        assert!(EngineConfig::from_toml_str("[pools]\ndisk_threads = 0").is_err());
        assert!(EngineConfig::from_toml_str("[pools]\nsource_threads = 0").is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pictor.toml");
        std::fs::write(&path, "buffer_pool_bytes = 77").unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().buffer_pool_bytes, 77);
        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.toml")),
            Err(EngineError::Io { .. })
        ));
    }

    #[test]
    fn test_configured_directory_wins() {
        let temp = TempDir::new().unwrap();
        let configured = temp.path().join("configured");
        let mut inputs = inputs(temp.path());
        inputs.configured = Some(configured.clone());
        inputs.env_override = Some(temp.path().join("env"));
        assert_eq!(cache_dir_from_inputs(inputs).unwrap(), configured);
        assert!(configured.is_dir());
    }

    #[test]
    fn test_xdg_layout() {
        let temp = TempDir::new().unwrap();
        let mut inputs = inputs(temp.path());
        inputs.xdg_cache_home = Some(temp.path().join("xdg"));
        assert_eq!(
            cache_dir_from_inputs(inputs).unwrap(),
            temp.path()
                .join("xdg")
                .join("pictor")
                .join(DEFAULT_DISK_CACHE_DIR)
        );
    }

    #[test]
    fn test_falls_back_to_temp_dir() {
        let temp = TempDir::new().unwrap();
        let mut inputs = inputs(temp.path());
        inputs.home_dir = Some(PathBuf::from("/homeless-shelter"));
        assert_eq!(
            cache_dir_from_inputs(inputs).unwrap(),
            temp.path().join("pictor").join(DEFAULT_DISK_CACHE_DIR)
        );
    }
}
