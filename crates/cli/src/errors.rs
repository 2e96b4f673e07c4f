//! CLI error types and exit code mapping

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use pictor_engine::EngineError;
use std::path::PathBuf;
use thiserror::Error;

/// Successful run
pub const EXIT_OK: i32 = 0;
/// Runtime failure: I/O, missing entries, busy entries
pub const EXIT_FAILURE: i32 = 1;
/// Invalid arguments or configuration
pub const EXIT_CLI: i32 = 2;

/// Errors reported by `pictor` commands
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// Arguments or configuration do not fit the cache
    #[error("CLI/configuration error: {message}")]
    #[diagnostic(code(pictor::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },

    /// Engine configuration could not be loaded
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),

    /// The disk cache reported an error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Journal(#[from] pictor_journal::Error),

    /// Reading or writing a user-supplied file failed
    #[error("File operation failed: {operation} {}", path.display())]
    #[diagnostic(
        code(pictor::cli::file_error),
        help("Check file permissions and ensure the path exists")
    )]
    File {
        /// Operation that failed
        operation: String,
        /// File involved
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Writing results failed
    #[error("Failed to write output")]
    #[diagnostic(code(pictor::cli::output))]
    Output {
        /// The underlying error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The requested entry does not exist
    #[error("No readable entry named {key}")]
    #[diagnostic(code(pictor::cli::not_found))]
    NotFound {
        /// Key that was looked up
        key: String,
    },

    /// Another editor holds the entry
    #[error("Entry {key} is being edited")]
    #[diagnostic(
        code(pictor::cli::busy),
        help("Another process has an open edit for this entry; retry once it finishes")
    )]
    Busy {
        /// Key of the entry
        key: String,
    },

    /// Logging could not be set up
    #[error("Tracing initialization failed: {message}")]
    #[diagnostic(code(pictor::cli::tracing))]
    Tracing {
        /// Why initialization failed
        message: String,
    },
}

impl CliError {
    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a configuration error with help text
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create a file error
    #[must_use]
    pub fn file(
        operation: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::File {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create an output error
    #[must_use]
    pub fn output(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Output {
            source: Box::new(source),
        }
    }

    /// Short machine-readable category
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } | Self::Engine(EngineError::Configuration { .. }) => "config",
            Self::Engine(_) | Self::Journal(_) => "cache",
            Self::File { .. } | Self::Output { .. } => "io",
            Self::NotFound { .. } => "not_found",
            Self::Busy { .. } => "busy",
            Self::Tracing { .. } => "tracing",
        }
    }
}

/// Map an error to the process exit code
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. }
        | CliError::Engine(EngineError::Configuration { .. })
        | CliError::Journal(
            pictor_journal::Error::Configuration { .. } | pictor_journal::Error::InvalidKey { .. },
        ) => EXIT_CLI,
        _ => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_exit_with_cli_code() {
        assert_eq!(exit_code_for(&CliError::config("bad")), EXIT_CLI);
        assert_eq!(
            exit_code_for(&CliError::Engine(EngineError::configuration("bad"))),
            EXIT_CLI
        );
        assert_eq!(
            exit_code_for(&CliError::Journal(pictor_journal::Error::configuration(
                "bad"
            ))),
            EXIT_CLI
        );
    }

    #[test]
    fn test_runtime_errors_exit_with_failure_code() {
        let err = CliError::NotFound {
            key: "k".to_string(),
        };
        assert_eq!(exit_code_for(&err), EXIT_FAILURE);
        assert_eq!(err.category(), "not_found");

        let err = CliError::file(
            "read",
            "/missing",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert_eq!(exit_code_for(&err), EXIT_FAILURE);
        assert_eq!(err.to_string(), "File operation failed: read /missing");
    }

    #[test]
    fn test_help_is_attached() {
        let err = CliError::config_with_help("wrong value count", "pass one file per value");
        assert!(matches!(
            err,
            CliError::Config { help: Some(ref h), .. } if h == "pass one file per value"
        ));
    }
}
