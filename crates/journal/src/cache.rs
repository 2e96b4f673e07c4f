//! Size-bounded LRU cache persisted through an append-only journal
//!
//! Each entry owns `value_count` files named `<key>.<index>`. Edits write to
//! `<key>.<index>.tmp` and are renamed into place on commit, so a reader never
//! observes a partially written value. The journal records every state change
//! and is replayed on open; stale lines are compacted away by rewriting the
//! journal to a temporary file and swapping it in through a backup rename.

use crate::error::{Error, Result};
use crate::record::{
    Header, JOURNAL_FILE, JOURNAL_FILE_BACKUP, JOURNAL_FILE_TEMP, Record,
};
use lru::LruCache;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Redundant journal lines tolerated before a rewrite is scheduled
const REDUNDANT_LINE_COMPACT_THRESHOLD: usize = 2000;

/// Longest accepted key, in bytes
const MAX_KEY_LEN: usize = 120;

/// Editor id given to edits replayed from the journal
const RECOVERED_EDITOR: u64 = 0;

#[derive(Debug)]
struct Entry {
    lengths: Vec<u64>,
    /// True once the entry has been committed at least once
    readable: bool,
    current_editor: Option<u64>,
    /// Assigned on every successful commit
    sequence: u64,
}

impl Entry {
    fn new(value_count: usize) -> Self {
        Self {
            lengths: vec![0; value_count],
            readable: false,
            current_editor: None,
            sequence: 0,
        }
    }
}

struct State {
    /// Iteration order is most-recently-touched first
    entries: LruCache<String, Entry>,
    /// `None` once the cache is closed
    writer: Option<BufWriter<File>>,
    size: u64,
    max_size: u64,
    /// Lines written after the header of the current journal
    journal_lines: usize,
    next_sequence: u64,
    next_editor_id: u64,
}

impl State {
    fn ensure_open(&self) -> Result<()> {
        if self.writer.is_some() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Lines that no longer describe the final state of their key
    fn redundant_lines(&self) -> usize {
        self.journal_lines.saturating_sub(self.entries.len())
    }

    fn rebuild_required(&self) -> bool {
        let redundant = self.redundant_lines();
        redundant >= REDUNDANT_LINE_COMPACT_THRESHOLD && redundant >= self.entries.len()
    }
}

struct Inner {
    directory: PathBuf,
    app_version: u32,
    value_count: usize,
    state: Mutex<State>,
    cleanup: mpsc::UnboundedSender<()>,
}

/// A journal-backed LRU cache of files on disk
///
/// Cloning is cheap and every clone refers to the same cache.
#[derive(Clone)]
pub struct DiskLruCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DiskLruCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskLruCache")
            .field("directory", &self.inner.directory)
            .field("app_version", &self.inner.app_version)
            .field("value_count", &self.inner.value_count)
            .finish_non_exhaustive()
    }
}

impl DiskLruCache {
    /// Opens the cache in `directory`, creating it if it does not exist
    ///
    /// A journal written by a different `app_version` or `value_count`, or one
    /// that cannot be parsed, causes the directory to be wiped and the cache to
    /// start out empty.
    pub fn open(
        directory: impl Into<PathBuf>,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> Result<Self> {
        let directory = directory.into();
        if max_size == 0 {
            return Err(Error::configuration("max_size must be greater than zero"));
        }
        if value_count == 0 {
            return Err(Error::configuration(
                "value_count must be greater than zero",
            ));
        }

        fs::create_dir_all(&directory).map_err(|e| Error::io(e, &directory, "create"))?;
        recover_backup(&directory)?;

        let cache = Self::unopened(directory, app_version, value_count, max_size)?;
        let inner = &cache.inner;
        {
            let mut state = inner.state.lock();
            match inner.replay_journal(&mut state) {
                Ok(true) => return Ok(cache.clone()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        target: "pictor::journal",
                        directory = %inner.directory.display(),
                        error = %e,
                        "Disk cache journal is corrupt, removing cache directory"
                    );
                    inner.reset(&mut state);
                    match fs::remove_dir_all(&inner.directory) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(Error::io(e, &inner.directory, "remove")),
                    }
                }
            }

            fs::create_dir_all(&inner.directory)
                .map_err(|e| Error::io(e, &inner.directory, "create"))?;
            inner.rebuild_journal(&mut state)?;
        }
        Ok(cache)
    }

    fn unopened(
        directory: PathBuf,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            directory,
            app_version,
            value_count,
            state: Mutex::new(State {
                entries: LruCache::unbounded(),
                writer: None,
                size: 0,
                max_size,
                journal_lines: 0,
                next_sequence: 0,
                next_editor_id: RECOVERED_EDITOR + 1,
            }),
            cleanup: tx,
        });
        spawn_cleanup(Arc::downgrade(&inner), rx)?;
        Ok(Self { inner })
    }

    /// Returns a snapshot of the entry named `key`, or `None` if it is absent
    /// or not readable
    ///
    /// A readable entry whose files have gone missing is removed and reported
    /// as a miss.
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        validate_key(key)?;
        let inner = &self.inner;
        let mut guard = inner.state.lock();
        let state = &mut *guard;
        state.ensure_open()?;

        let (sequence, lengths) = match state.entries.get(key) {
            Some(entry) if entry.readable => (entry.sequence, entry.lengths.clone()),
            _ => return Ok(None),
        };

        let mut files = Vec::with_capacity(inner.value_count);
        for index in 0..inner.value_count {
            let path = inner.clean_file(key, index);
            match File::open(&path) {
                Ok(file) => files.push((path, file)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(
                        target: "pictor::journal",
                        key,
                        index,
                        "Value file missing, invalidating entry"
                    );
                    inner.remove_entry(state, key)?;
                    return Ok(None);
                }
                Err(e) => return Err(Error::io(e, &path, "open")),
            }
        }

        inner.append(state, &Record::Read { key })?;
        if state.rebuild_required() {
            inner.schedule_cleanup();
        }

        Ok(Some(Snapshot {
            cache: self.clone(),
            key: key.to_string(),
            sequence,
            lengths,
            files,
        }))
    }

    /// Opens an editor for `key`, or returns `None` if another edit is in
    /// progress
    pub fn edit(&self, key: &str) -> Result<Option<Editor>> {
        self.edit_at(key, None)
    }

    fn edit_at(&self, key: &str, expected_sequence: Option<u64>) -> Result<Option<Editor>> {
        validate_key(key)?;
        let inner = &self.inner;
        let mut guard = inner.state.lock();
        let state = &mut *guard;
        state.ensure_open()?;

        let id = state.next_editor_id;
        let created = match state.entries.get_mut(key) {
            Some(entry) => {
                if expected_sequence.is_some_and(|seq| seq != entry.sequence) {
                    return Ok(None);
                }
                if entry.current_editor.is_some() {
                    return Ok(None);
                }
                entry.current_editor = Some(id);
                false
            }
            None => {
                if expected_sequence.is_some() {
                    return Ok(None);
                }
                let mut entry = Entry::new(inner.value_count);
                entry.current_editor = Some(id);
                state.entries.put(key.to_string(), entry);
                true
            }
        };
        state.next_editor_id += 1;

        // Make the DIRTY line durable before any temporary file exists.
        let appended = inner
            .append(state, &Record::Dirty { key })
            .and_then(|()| inner.flush_writer(state));
        if let Err(e) = appended {
            if created {
                state.entries.pop(key);
            } else if let Some(entry) = state.entries.peek_mut(key) {
                entry.current_editor = None;
            }
            return Err(e);
        }

        Ok(Some(Editor {
            cache: self.clone(),
            key: key.to_string(),
            id,
            written: vec![false; inner.value_count],
            done: false,
        }))
    }

    /// Drops the entry for `key`, returning whether anything was removed
    ///
    /// Entries that are being edited cannot be removed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        self.inner.remove_entry(&mut state, key)
    }

    /// Bytes currently used by committed values
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.state.lock().size
    }

    /// The size budget
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.inner.state.lock().max_size
    }

    /// Changes the size budget and schedules eviction down to it
    pub fn set_max_size(&self, max_size: u64) {
        self.inner.state.lock().max_size = max_size;
        self.inner.schedule_cleanup();
    }

    /// Number of indexed entries, including ones whose first edit is open
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Returns true if no entry is indexed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Directory holding the journal and value files
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Number of values stored per entry
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.inner.value_count
    }

    /// Returns true once `close` or `delete` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().writer.is_none()
    }

    /// Evicts down to the size budget and flushes buffered journal lines
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        self.inner.trim_to_size(&mut state)?;
        self.inner.flush_writer(&mut state)
    }

    /// Aborts open edits, evicts down to budget and closes the journal
    ///
    /// Closing an already closed cache is a no-op.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.writer.is_none() {
            return Ok(());
        }

        let editing: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.current_editor.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        for key in editing {
            inner.finish_edit(&mut state, &key, false)?;
        }

        inner.trim_to_size(&mut state)?;
        if let Some(mut writer) = state.writer.take() {
            writer
                .flush()
                .map_err(|e| Error::io(e, inner.journal_path(), "flush"))?;
        }
        Ok(())
    }

    /// Closes the cache and deletes its directory, including files it did not
    /// create
    pub fn delete(&self) -> Result<()> {
        self.close()?;
        match fs::remove_dir_all(&self.inner.directory) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &self.inner.directory, "remove")),
        }
    }

    #[cfg(test)]
    fn redundant_lines(&self) -> usize {
        self.inner.state.lock().redundant_lines()
    }
}

impl Inner {
    fn journal_path(&self) -> PathBuf {
        self.directory.join(JOURNAL_FILE)
    }

    fn clean_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{key}.{index}"))
    }

    fn dirty_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{key}.{index}.tmp"))
    }

    fn header(&self) -> Header {
        Header {
            app_version: self.app_version,
            value_count: self.value_count,
        }
    }

    fn schedule_cleanup(&self) {
        // The worker only exits once every sender is gone.
        let _ = self.cleanup.send(());
    }

    fn reset(&self, state: &mut State) {
        state.entries.clear();
        state.writer = None;
        state.size = 0;
        state.journal_lines = 0;
    }

    fn append(&self, state: &mut State, record: &Record<'_>) -> Result<()> {
        let writer = state.writer.as_mut().ok_or(Error::Closed)?;
        writeln!(writer, "{record}").map_err(|e| Error::io(e, self.journal_path(), "append"))?;
        state.journal_lines += 1;
        Ok(())
    }

    fn flush_writer(&self, state: &mut State) -> Result<()> {
        let writer = state.writer.as_mut().ok_or(Error::Closed)?;
        writer
            .flush()
            .map_err(|e| Error::io(e, self.journal_path(), "flush"))
    }

    /// Replays the journal into `state`; returns false if there is none
    fn replay_journal(&self, state: &mut State) -> Result<bool> {
        let path = self.journal_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        let text = String::from_utf8(bytes)
            .map_err(|_| Error::corrupt("journal is not valid UTF-8"))?;

        let mut lines: Vec<&str> = text.split('\n').collect();
        // Either the empty tail after the last newline or an unterminated line.
        let truncated = lines.pop().is_some_and(|tail| !tail.is_empty());

        let header = self.header();
        header.check(&lines)?;
        let records = &lines[Header::LINES..];
        for line in records {
            let record = Record::parse(line, self.value_count)?;
            apply_record(state, record, self.value_count);
        }
        state.journal_lines = records.len();
        self.process_journal(state)?;

        if truncated {
            tracing::debug!(
                target: "pictor::journal",
                journal = %path.display(),
                "Journal ends with an unterminated line, rewriting"
            );
            self.rebuild_journal(state)?;
        } else {
            let file = OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|e| Error::io(e, &path, "open"))?;
            state.writer = Some(BufWriter::new(file));
            if state.rebuild_required() {
                self.rebuild_journal(state)?;
            }
        }

        tracing::debug!(
            target: "pictor::journal",
            directory = %self.directory.display(),
            entries = state.entries.len(),
            size = state.size,
            "Opened disk cache"
        );
        Ok(true)
    }

    /// Computes the initial size and drops entries whose edit was interrupted
    fn process_journal(&self, state: &mut State) -> Result<()> {
        delete_if_exists(&self.directory.join(JOURNAL_FILE_TEMP))?;

        let mut interrupted = Vec::new();
        for (key, entry) in &state.entries {
            if entry.current_editor.is_none() {
                state.size += entry.lengths.iter().sum::<u64>();
            } else {
                interrupted.push(key.clone());
            }
        }

        for key in interrupted {
            state.entries.pop(&key);
            for index in 0..self.value_count {
                delete_if_exists(&self.clean_file(&key, index))?;
                delete_if_exists(&self.dirty_file(&key, index))?;
            }
        }
        Ok(())
    }

    /// Writes a journal containing only the current index and swaps it in
    fn rebuild_journal(&self, state: &mut State) -> Result<()> {
        if let Some(mut writer) = state.writer.take() {
            writer
                .flush()
                .map_err(|e| Error::io(e, self.journal_path(), "flush"))?;
        }

        let journal = self.journal_path();
        let temp = self.directory.join(JOURNAL_FILE_TEMP);
        let backup = self.directory.join(JOURNAL_FILE_BACKUP);

        let swapped = self
            .write_compacted(state, &temp)
            .and_then(|()| {
                if journal.exists() {
                    rename(&journal, &backup)?;
                }
                rename(&temp, &journal)?;
                delete_if_exists(&backup)
            });

        let file = OpenOptions::new()
            .append(true)
            .open(&journal)
            .map_err(|e| Error::io(e, &journal, "open"));
        match (swapped, file) {
            (Ok(()), Ok(file)) => {
                state.writer = Some(BufWriter::new(file));
                state.journal_lines = state.entries.len();
                tracing::debug!(
                    target: "pictor::journal",
                    journal = %journal.display(),
                    entries = state.entries.len(),
                    "Rewrote disk cache journal"
                );
                Ok(())
            }
            // Keep appending to whichever journal survived.
            (Err(e), Ok(file)) => {
                state.writer = Some(BufWriter::new(file));
                Err(e)
            }
            (Err(e), Err(_)) | (Ok(()), Err(e)) => Err(e),
        }
    }

    fn write_compacted(&self, state: &State, temp: &Path) -> Result<()> {
        let file = File::create(temp).map_err(|e| Error::io(e, temp, "create"))?;
        let mut out = BufWriter::new(file);
        let write = |out: &mut BufWriter<File>| -> io::Result<()> {
            self.header().write_to(out)?;
            // Oldest first so that replay restores the recency order.
            for (key, entry) in state.entries.iter().rev() {
                let record = if entry.current_editor.is_some() {
                    Record::Dirty { key }
                } else {
                    Record::Clean {
                        key,
                        lengths: Cow::Borrowed(&entry.lengths),
                    }
                };
                writeln!(out, "{record}")?;
            }
            out.flush()?;
            out.get_ref().sync_all()
        };
        write(&mut out).map_err(|e| Error::io(e, temp, "write"))
    }

    fn complete_edit(&self, key: &str, id: u64, written: &[bool], success: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let entry = state
            .entries
            .peek(key)
            .filter(|entry| entry.current_editor == Some(id));
        assert!(
            entry.is_some(),
            "editor for {key} is no longer the active editor of its entry"
        );
        let readable = entry.is_some_and(|entry| entry.readable);

        if success && !readable {
            for (index, was_written) in written.iter().enumerate() {
                if !was_written {
                    self.finish_edit(&mut state, key, false)?;
                    return Err(Error::IncompleteEntry {
                        key: key.to_string(),
                        index,
                    });
                }
                if !self.dirty_file(key, index).exists() {
                    tracing::debug!(
                        target: "pictor::journal",
                        key,
                        index,
                        "Temporary value file disappeared, aborting edit"
                    );
                    return self.finish_edit(&mut state, key, false);
                }
            }
        }

        self.finish_edit(&mut state, key, success)
    }

    fn finish_edit(&self, state: &mut State, key: &str, success: bool) -> Result<()> {
        let Some(entry) = state.entries.peek_mut(key) else {
            return Ok(());
        };

        for index in 0..self.value_count {
            let dirty = self.dirty_file(key, index);
            if success {
                if dirty.exists() {
                    let clean = self.clean_file(key, index);
                    rename(&dirty, &clean)?;
                    let length = fs::metadata(&clean)
                        .map_err(|e| Error::io(e, &clean, "stat"))?
                        .len();
                    state.size = state.size - entry.lengths[index] + length;
                    entry.lengths[index] = length;
                }
            } else {
                delete_if_exists(&dirty)?;
            }
        }

        entry.current_editor = None;
        if entry.readable || success {
            entry.readable = true;
            if success {
                entry.sequence = state.next_sequence;
                state.next_sequence += 1;
            }
            let lengths = entry.lengths.clone();
            self.append(
                state,
                &Record::Clean {
                    key,
                    lengths: Cow::Owned(lengths),
                },
            )?;
        } else {
            state.entries.pop(key);
            self.append(state, &Record::Remove { key })?;
        }
        self.flush_writer(state)?;

        if state.size > state.max_size || state.rebuild_required() {
            self.schedule_cleanup();
        }
        Ok(())
    }

    fn remove_entry(&self, state: &mut State, key: &str) -> Result<bool> {
        match state.entries.peek(key) {
            Some(entry) if entry.current_editor.is_none() => {}
            _ => return Ok(false),
        }

        for index in 0..self.value_count {
            delete_if_exists(&self.clean_file(key, index))?;
        }
        if let Some(entry) = state.entries.pop(key) {
            state.size -= entry.lengths.iter().sum::<u64>();
        }
        self.append(state, &Record::Remove { key })?;

        if state.rebuild_required() {
            self.schedule_cleanup();
        }
        Ok(true)
    }

    /// Evicts least recently used entries until the size fits the budget
    fn trim_to_size(&self, state: &mut State) -> Result<()> {
        while state.size > state.max_size {
            let victim = state
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.current_editor.is_none())
                .map(|(key, _)| key.clone());
            let Some(key) = victim else {
                break;
            };
            tracing::trace!(target: "pictor::journal", key = %key, "Evicting disk cache entry");
            self.remove_entry(state, &key)?;
        }
        Ok(())
    }

    fn cleanup(&self) {
        let mut state = self.state.lock();
        if state.writer.is_none() {
            return;
        }
        if let Err(e) = self.trim_to_size(&mut state) {
            tracing::warn!(target: "pictor::journal", error = %e, "Disk cache trim failed");
        }
        if state.rebuild_required() {
            if let Err(e) = self.rebuild_journal(&mut state) {
                tracing::warn!(target: "pictor::journal", error = %e, "Journal rewrite failed");
            }
        }
    }
}

fn apply_record(state: &mut State, record: Record<'_>, value_count: usize) {
    match record {
        Record::Clean { key, lengths } => {
            let entry = state
                .entries
                .get_or_insert_mut(key.to_string(), || Entry::new(value_count));
            entry.readable = true;
            entry.current_editor = None;
            entry.lengths = lengths.into_owned();
        }
        Record::Dirty { key } => {
            let entry = state
                .entries
                .get_or_insert_mut(key.to_string(), || Entry::new(value_count));
            entry.current_editor = Some(RECOVERED_EDITOR);
        }
        Record::Remove { key } => {
            state.entries.pop(key);
        }
        Record::Read { key } => {
            let _ = state.entries.get(key);
        }
    }
}

fn spawn_cleanup(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<()>) -> Result<()> {
    std::thread::Builder::new()
        .name("pictor-disk-lru-cleanup".to_string())
        .spawn(move || {
            while rx.blocking_recv().is_some() {
                // Coalesce requests that piled up while the last pass ran.
                while rx.try_recv().is_ok() {}
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.cleanup();
            }
        })
        .map_err(|e| Error::io_no_path(e, "spawn cleanup thread"))?;
    Ok(())
}

/// Resolves a rewrite interrupted between renaming the journal away and
/// moving the new one into place
fn recover_backup(directory: &Path) -> Result<()> {
    let backup = directory.join(JOURNAL_FILE_BACKUP);
    if backup.exists() {
        let journal = directory.join(JOURNAL_FILE);
        if journal.exists() {
            delete_if_exists(&backup)?;
        } else {
            rename(&backup, &journal)?;
        }
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    let reason = if key.is_empty() {
        "key is empty"
    } else if key.len() > MAX_KEY_LEN {
        "key is longer than 120 bytes"
    } else if !key
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
    {
        "key must match [a-z0-9_-]"
    } else {
        return Ok(());
    };
    Err(Error::InvalidKey {
        key: key.to_string(),
        reason,
    })
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| Error::io(e, from, "rename"))
}

fn delete_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(e, path, "delete")),
    }
}

/// A point-in-time view of an entry's values
///
/// The value files are opened when the snapshot is taken, so a later commit
/// to the same key does not change what the snapshot reads.
#[derive(Debug)]
pub struct Snapshot {
    cache: DiskLruCache,
    key: String,
    sequence: u64,
    lengths: Vec<u64>,
    files: Vec<(PathBuf, File)>,
}

impl Snapshot {
    /// Key of the entry
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Sequence number of the commit this snapshot observed
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.sequence
    }

    /// Path of the value file at `index`
    #[must_use]
    pub fn file(&self, index: usize) -> &Path {
        &self.files[index].0
    }

    /// Byte length of the value at `index` when it was committed
    #[must_use]
    pub fn length(&self, index: usize) -> u64 {
        self.lengths[index]
    }

    /// Reads the value at `index`
    pub fn read(&self, index: usize) -> Result<Vec<u8>> {
        let (path, file) = &self.files[index];
        let mut file = file;
        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut buf))
            .map_err(|e| Error::io(e, path, "read"))?;
        Ok(buf)
    }

    /// Reads the value at `index` as UTF-8
    pub fn read_to_string(&self, index: usize) -> Result<String> {
        let bytes = self.read(index)?;
        String::from_utf8(bytes).map_err(|e| {
            Error::io(
                io::Error::new(io::ErrorKind::InvalidData, e),
                self.file(index),
                "decode",
            )
        })
    }

    /// Opens an editor for this entry, or `None` if the entry changed since the
    /// snapshot was taken or another edit is in progress
    pub fn edit(&self) -> Result<Option<Editor>> {
        self.cache.edit_at(&self.key, Some(self.sequence))
    }
}

/// Exclusive write access to one entry
///
/// Values are written to temporary files that only become visible on
/// [`Editor::commit`]. Dropping an editor without committing aborts the edit.
#[derive(Debug)]
pub struct Editor {
    cache: DiskLruCache,
    key: String,
    id: u64,
    written: Vec<bool>,
    done: bool,
}

impl Editor {
    /// Key of the entry being edited
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Path of the temporary file for the value at `index`
    ///
    /// Calling this marks the index as written.
    pub fn file(&mut self, index: usize) -> Result<PathBuf> {
        let inner = &self.cache.inner;
        assert!(
            index < inner.value_count,
            "value index {index} out of range for {} values",
            inner.value_count
        );
        {
            let state = inner.state.lock();
            state.ensure_open()?;
            let owned = state
                .entries
                .peek(&self.key)
                .is_some_and(|entry| entry.current_editor == Some(self.id));
            assert!(owned, "editor for {} is no longer active", self.key);
        }
        self.written[index] = true;
        fs::create_dir_all(&inner.directory)
            .map_err(|e| Error::io(e, &inner.directory, "create"))?;
        Ok(inner.dirty_file(&self.key, index))
    }

    /// Writes the value at `index`
    pub fn set(&mut self, index: usize, data: impl AsRef<[u8]>) -> Result<()> {
        let path = self.file(index)?;
        fs::write(&path, data).map_err(|e| Error::io(e, &path, "write"))
    }

    /// Reads the last committed value at `index`, if the entry has one
    pub fn get_string(&self, index: usize) -> Result<Option<String>> {
        let inner = &self.cache.inner;
        let readable = {
            let state = inner.state.lock();
            state.ensure_open()?;
            state
                .entries
                .peek(&self.key)
                .is_some_and(|entry| entry.readable)
        };
        if !readable {
            return Ok(None);
        }
        let path = inner.clean_file(&self.key, index);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &path, "read")),
        }
    }

    /// Publishes the written values
    ///
    /// A new entry must have written every index; otherwise the edit is
    /// aborted and [`Error::IncompleteEntry`] is returned.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.cache
            .inner
            .complete_edit(&self.key, self.id, &self.written, true)
    }

    /// Discards the written values
    pub fn abort(mut self) -> Result<()> {
        self.done = true;
        self.cache
            .inner
            .complete_edit(&self.key, self.id, &self.written, false)
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self
            .cache
            .inner
            .complete_edit(&self.key, self.id, &self.written, false)
        {
            tracing::debug!(
                target: "pictor::journal",
                key = %self.key,
                error = %e,
                "Abandoned edit could not be aborted"
            );
        }
    }
}
