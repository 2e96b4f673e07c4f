//! Error types for the load engine
//!
//! [`EngineError`] covers setting the engine up. [`LoadError`] is the outcome
//! delivered to waiters of a failed load; it is cloned once per waiter.

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Errors raised while building or configuring the engine
#[derive(Error, Debug, Diagnostic)]
pub enum EngineError {
    /// Invalid configuration value
    #[error("Engine configuration error: {message}")]
    #[diagnostic(code(pictor::engine::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// I/O error outside the disk cache
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(pictor::engine::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed
        operation: String,
    },

    /// The disk cache could not be opened or used
    #[error(transparent)]
    #[diagnostic(transparent)]
    Journal(#[from] pictor_journal::Error),

    /// A worker or coordination thread could not be started
    #[error("Failed to spawn thread {name}")]
    #[diagnostic(code(pictor::engine::thread_spawn))]
    ThreadSpawn {
        /// Name of the thread
        name: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A task was submitted to an executor that is shutting down
    #[error("Executor {executor} rejected a task after shutdown")]
    #[diagnostic(code(pictor::engine::rejected))]
    Rejected {
        /// Name of the executor
        executor: String,
    },
}

impl EngineError {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }
}

/// Result type for engine setup operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Why a load did not produce a resource
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum LoadError {
    /// Fetching or decoding the source failed
    #[error("Failed to load {key}: {message}")]
    #[diagnostic(code(pictor::load::fetch_failed))]
    FetchFailed {
        /// Request that failed
        key: String,
        /// Top-level failure message
        message: String,
        /// Messages of the underlying causes, outermost first
        causes: Vec<String>,
    },

    /// Every stage ran but none produced a resource
    #[error("No result produced for {key}")]
    #[diagnostic(
        code(pictor::load::no_result),
        help("Requests limited to the disk cache fail this way on a cache miss")
    )]
    NoResult {
        /// Request that produced nothing
        key: String,
    },

    /// The load was cancelled before it completed
    #[error("Load cancelled")]
    #[diagnostic(code(pictor::load::cancelled))]
    Cancelled,

    /// The decode pipeline panicked
    #[error("Decode pipeline panicked: {message}")]
    #[diagnostic(code(pictor::load::panicked))]
    Panicked {
        /// Panic payload rendered as text
        message: String,
    },

    /// The coordination context is gone
    #[error("Engine has shut down")]
    #[diagnostic(code(pictor::load::shut_down))]
    EngineShutDown,
}

impl LoadError {
    /// Create a fetch failure from a message
    #[must_use]
    pub fn fetch_failed(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FetchFailed {
            key: key.into(),
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Create a fetch failure from an error, capturing its source chain
    #[must_use]
    pub fn from_error(key: impl Into<String>, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self::FetchFailed {
            key: key.into(),
            message: error.to_string(),
            causes,
        }
    }

    /// Create a no-result error
    #[must_use]
    pub fn no_result(key: impl Into<String>) -> Self {
        Self::NoResult { key: key.into() }
    }
}
