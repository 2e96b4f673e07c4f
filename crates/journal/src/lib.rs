//! Journal-backed, size-bounded LRU disk cache for pictor
//!
//! This crate provides the persistent tier of the pictor image cache:
//! - A fixed number of value files per key, written through temporary files
//!   and published atomically on commit
//! - An append-only journal (`journal`) replayed on open, with interrupted
//!   edits discarded and corrupt journals reset to an empty cache
//! - Least-recently-used eviction down to a byte budget on a background thread
//! - Journal compaction through `journal.tmp` and `journal.bkp` so a crash at
//!   any point leaves a recoverable journal
//!
//! # Journal format
//!
//! ```text
//! pictor.io.DiskLruCache
//! 1
//! <app version>
//! <value count>
//!
//! DIRTY <key>
//! CLEAN <key> <len_0> ... <len_{n-1}>
//! REMOVE <key>
//! READ <key>
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pictor_journal::DiskLruCache;
//!
//! # fn main() -> pictor_journal::Result<()> {
//! let cache = DiskLruCache::open("/tmp/pictor-cache", 1, 1, 10 * 1024 * 1024)?;
//! if let Some(mut editor) = cache.edit("thumbnail-1")? {
//!     editor.set(0, b"decoded bytes")?;
//!     editor.commit()?;
//! }
//! if let Some(snapshot) = cache.get("thumbnail-1")? {
//!     assert_eq!(snapshot.read(0)?, b"decoded bytes");
//! }
//! # Ok(())
//! # }
//! ```

#![expect(
    clippy::missing_errors_doc,
    reason = "Every fallible operation returns the crate Error; documented on the type"
)]

mod cache;
mod error;
mod record;

pub use cache::{DiskLruCache, Editor, Snapshot};
pub use error::{Error, Result};
pub use record::{Header, JOURNAL_FILE, JOURNAL_FILE_BACKUP, JOURNAL_FILE_TEMP, MAGIC, VERSION};
