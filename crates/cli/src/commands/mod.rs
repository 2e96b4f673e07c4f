//! Command implementations

pub mod cache;

use crate::cli::OkEnvelope;
use crate::errors::CliError;
use cache::CacheTarget;
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;

/// A parsed command, independent of the clap definitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show cache location and usage
    CacheInfo,
    /// Read one value of an entry
    CacheGet {
        /// Entry key
        key: String,
        /// Value index
        index: usize,
        /// Destination file; stdout when absent
        out: Option<PathBuf>,
    },
    /// Store files as the values of an entry
    CachePut {
        /// Entry key
        key: String,
        /// One file per value
        files: Vec<PathBuf>,
    },
    /// Remove an entry
    CacheRemove {
        /// Entry key
        key: String,
    },
    /// Evict down to a budget
    CacheTrim {
        /// Budget in bytes
        max_bytes: u64,
    },
    /// Delete the cache
    CacheClear,
}

impl Command {
    /// Name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CacheInfo => "cache info",
            Self::CacheGet { .. } => "cache get",
            Self::CachePut { .. } => "cache put",
            Self::CacheRemove { .. } => "cache remove",
            Self::CacheTrim { .. } => "cache trim",
            Self::CacheClear => "cache clear",
        }
    }
}

/// Global options every command sees
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Engine configuration file
    pub config: Option<PathBuf>,
    /// Cache directory override
    pub dir: Option<PathBuf>,
    /// Emit JSON envelopes instead of text
    pub json: bool,
}

/// Run `command`, writing its result to `out`
pub fn execute(command: Command, context: &Context, out: &mut impl Write) -> Result<(), CliError> {
    let _span = tracing::info_span!("command", command = command.name()).entered();
    let target = CacheTarget::resolve(context)?;
    tracing::debug!(
        directory = %target.directory.display(),
        app_version = target.app_version,
        "Resolved disk cache"
    );
    let json = context.json;
    match command {
        Command::CacheInfo => cache::info(&target, json, out),
        Command::CacheGet { key, index, out: path } => {
            cache::get(&target, &key, index, path.as_deref(), json, out)
        }
        Command::CachePut { key, files } => cache::put(&target, &key, &files, json, out),
        Command::CacheRemove { key } => cache::remove(&target, &key, json, out),
        Command::CacheTrim { max_bytes } => cache::trim(&target, max_bytes, json, out),
        Command::CacheClear => cache::clear(&target, json, out),
    }
}

/// Write a report as text or as a JSON envelope
fn emit<T: Serialize + fmt::Display>(
    out: &mut impl Write,
    json: bool,
    report: &T,
) -> Result<(), CliError> {
    let written = if json {
        let text = serde_json::to_string(&OkEnvelope::new(report)).map_err(CliError::output)?;
        writeln!(out, "{text}")
    } else {
        writeln!(out, "{report}")
    };
    written.map_err(CliError::output)
}
