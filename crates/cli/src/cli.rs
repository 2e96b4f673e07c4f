//! Command line definition and JSON result envelopes

use crate::commands::Command;
use crate::errors::CliError;
use crate::tracing::LogLevel;
use clap::{Parser, Subcommand};
use miette::Report;
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;

/// Inspect and maintain pictor image disk caches
#[derive(Parser, Debug)]
#[command(name = "pictor")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "PICTOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disk cache directory, overriding the configuration
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    /// Set logging level
    #[arg(short = 'l', long, global = true, default_value = "warn", value_enum)]
    pub level: LogLevel,

    /// Emit results and logs as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Disk cache operations
    Cache {
        /// The cache operation
        #[command(subcommand)]
        subcommand: CacheCommands,
    },
}

/// Operations on a disk cache directory
#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show location, size and budget of the cache
    Info,
    /// Read one value of an entry
    Get {
        /// Entry key
        key: String,
        /// Value index within the entry
        #[arg(long, default_value_t = 0)]
        index: usize,
        /// Write the value to this file instead of stdout
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },
    /// Store files as the values of an entry
    Put {
        /// Entry key
        key: String,
        /// One file per value, in index order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Remove an entry
    Remove {
        /// Entry key
        key: String,
    },
    /// Evict least recently used entries down to a budget
    Trim {
        /// Budget in bytes
        #[arg(long)]
        max_bytes: u64,
    },
    /// Delete every entry together with the cache directory
    Clear,
}

impl From<Commands> for Command {
    fn from(cmd: Commands) -> Self {
        match cmd {
            Commands::Cache { subcommand } => match subcommand {
                CacheCommands::Info => Self::CacheInfo,
                CacheCommands::Get { key, index, out } => Self::CacheGet { key, index, out },
                CacheCommands::Put { key, files } => Self::CachePut { key, files },
                CacheCommands::Remove { key } => Self::CacheRemove { key },
                CacheCommands::Trim { max_bytes } => Self::CacheTrim { max_bytes },
                CacheCommands::Clear => Self::CacheClear,
            },
        }
    }
}

/// Parse process arguments, exiting on usage errors
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}

/// Success response envelope for JSON output
#[derive(Debug, Clone, Serialize)]
pub struct OkEnvelope<T> {
    /// Always "ok"
    pub status: &'static str,
    /// The command's report
    pub data: T,
}

impl<T> OkEnvelope<T> {
    /// Wrap a report
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self { status: "ok", data }
    }
}

/// Error response envelope for JSON output
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope<E> {
    /// Always "error"
    pub status: &'static str,
    /// The error details
    pub error: E,
}

impl<E> ErrorEnvelope<E> {
    /// Wrap error details
    #[must_use]
    pub const fn new(error: E) -> Self {
        Self {
            status: "error",
            error,
        }
    }
}

/// Render an error on stdout as JSON or on stderr through miette
#[allow(clippy::print_stdout, clippy::print_stderr)]
pub fn render_error(err: CliError, json_mode: bool) {
    if json_mode {
        let envelope = ErrorEnvelope::new(serde_json::json!({
            "code": err.category(),
            "message": err.to_string(),
        }));
        match serde_json::to_string(&envelope) {
            Ok(json) => println!("{json}"),
            Err(_) => eprintln!("Error serializing error response"),
        }
    } else {
        let report = Report::new(err);
        eprintln!("{report:?}");
        let _ = io::stderr().flush();
    }
}
