//! pictor - command line maintenance for pictor disk caches
//!
//! The binary wraps the journal-backed disk cache used by `pictor-engine`:
//!
//! - `pictor cache info` shows where the cache lives and how full it is
//! - `pictor cache get|put|remove` work on single entries
//! - `pictor cache trim` evicts down to a budget, `pictor cache clear` drops
//!   the directory
//!
//! Results print as text, or as `{"status": "ok", "data": ...}` envelopes with
//! `--json`. Logs always go to stderr.

#![expect(
    clippy::missing_errors_doc,
    reason = "Commands return CliError; variants are documented on the type"
)]

pub mod cli;
pub mod commands;
pub mod errors;
pub mod tracing;

pub use errors::{CliError, EXIT_CLI, EXIT_FAILURE, EXIT_OK, exit_code_for};
