//! Error types for the journal crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for disk cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while touching the cache directory
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(pictor::journal::io),
        help("Check file permissions and free space in the cache directory")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "rename", "append")
        operation: String,
    },

    /// Invalid cache parameters
    #[error("Disk cache configuration error: {message}")]
    #[diagnostic(code(pictor::journal::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// The journal could not be parsed
    #[error("Corrupt journal: {message}")]
    #[diagnostic(
        code(pictor::journal::corrupt),
        help("The cache directory is discarded and rebuilt when a corrupt journal is found on open")
    )]
    CorruptJournal {
        /// What was wrong with the journal
        message: String,
    },

    /// Key cannot be written to the journal
    #[error("Invalid cache key {key:?}: {reason}")]
    #[diagnostic(
        code(pictor::journal::invalid_key),
        help("Keys must be 1-120 bytes without whitespace or control characters")
    )]
    InvalidKey {
        /// The rejected key
        key: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// A newly created entry was committed without writing every value
    #[error("Newly created entry {key} did not write a value for index {index}")]
    #[diagnostic(
        code(pictor::journal::incomplete_entry),
        help("Write every value index before committing a new entry; the edit was aborted")
    )]
    IncompleteEntry {
        /// Key of the aborted entry
        key: String,
        /// First index without a value
        index: usize,
    },

    /// Operation attempted after `close()`
    #[error("Disk cache is closed")]
    #[diagnostic(code(pictor::journal::closed))]
    Closed,
}

impl Error {
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

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a corrupt journal error
    #[must_use]
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptJournal {
            message: msg.into(),
        }
    }
}

/// Result type for disk cache operations
pub type Result<T> = std::result::Result<T, Error>;
