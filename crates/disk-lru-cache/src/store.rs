//! Journaled, size-bounded LRU store of multi-slot entries
//!
//! Every entry is a fixed number of slot files named `<id>.<slot>`. Writes go
//! through an [`Editor`] into temp files that are renamed into place on
//! commit. All table mutation and journal appends happen under a single
//! lock so the journal order always matches the in-memory order.

use crate::editor::Editor;
use crate::error::{DiskCacheError, Result};
use crate::journal::{self, JournalHeader, JournalWriter, Record, REDUNDANT_OP_THRESHOLD};
use crate::key::EntryId;
use crate::snapshot::Snapshot;
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LOCK_FILE: &str = ".lock";
const TMP_SUFFIX: &str = ".tmp";

/// Configuration for a [`DiskStore`]
#[derive(Debug, Clone)]
pub struct DiskStoreConfig {
    pub directory: PathBuf,
    /// Bumping this discards everything stored under an older version
    pub schema_version: u32,
    pub slot_count: usize,
    pub max_size: u64,
}

impl DiskStoreConfig {
    pub fn new(directory: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            directory: directory.into(),
            schema_version: 1,
            slot_count: 1,
            max_size,
        }
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn with_slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count;
        self
    }
}

#[derive(Debug, Clone)]
struct Entry {
    lengths: Vec<u64>,
    /// True once any edit of this entry has committed
    readable: bool,
    /// Token of the open editor, if any
    editor: Option<u64>,
    /// Bumped on every commit; lets a snapshot detect it has gone stale
    sequence_number: u64,
}

struct State {
    entries: LruCache<EntryId, Entry>,
    /// `None` once the store is closed
    journal: Option<JournalWriter>,
    size: u64,
    max_size: u64,
    redundant_ops: usize,
    next_sequence_number: u64,
    next_edit_token: u64,
    lock_file: Option<File>,
}

impl State {
    fn check_open(&self) -> Result<()> {
        if self.journal.is_none() {
            return Err(DiskCacheError::Closed);
        }
        Ok(())
    }

    fn append(&mut self, record: &Record) -> Result<()> {
        self.journal
            .as_mut()
            .ok_or(DiskCacheError::Closed)?
            .append(record)
    }

    fn needs_compaction(&self) -> bool {
        self.redundant_ops >= REDUNDANT_OP_THRESHOLD && self.redundant_ops >= self.entries.len()
    }
}

pub(crate) struct Inner {
    directory: PathBuf,
    header: JournalHeader,
    state: Mutex<State>,
}

/// A journaled LRU cache rooted in one directory.
///
/// Cloning is cheap and every clone refers to the same store. Only one store
/// may be open per directory; a second `open` fails with
/// [`DiskCacheError::Locked`] until the first is closed or dropped.
#[derive(Clone)]
pub struct DiskStore {
    inner: Arc<Inner>,
}

impl DiskStore {
    /// Open the store, replaying or creating its journal.
    ///
    /// A journal written with a different schema version or slot count, or one
    /// that cannot be parsed, causes the directory to be wiped and the store to
    /// start empty.
    pub fn open(config: DiskStoreConfig) -> Result<Self> {
        if config.slot_count == 0 {
            return Err(DiskCacheError::InvalidConfig(
                "slot count must be at least 1".to_string(),
            ));
        }
        if config.max_size == 0 {
            return Err(DiskCacheError::InvalidConfig(
                "max size must be positive".to_string(),
            ));
        }

        let directory = config.directory;
        fs::create_dir_all(&directory)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(directory.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(DiskCacheError::Locked(directory.display().to_string()));
        }

        let header = JournalHeader {
            schema_version: config.schema_version,
            slot_count: config.slot_count,
        };

        // No editor can be open yet, so every temp file is garbage
        remove_temp_files(&directory)?;

        let mut entries = LruCache::unbounded();
        let mut size = 0;
        let mut redundant_ops = 0;
        match journal::replay(&directory, header) {
            Ok(Some(replayed)) => {
                for id in &replayed.abandoned {
                    for slot in 0..header.slot_count {
                        remove_if_exists(&clean_path(&directory, id, slot))?;
                    }
                }
                size = replayed.size;
                for (id, lengths) in replayed.entries {
                    entries.put(
                        id,
                        Entry {
                            lengths,
                            readable: true,
                            editor: None,
                            sequence_number: 0,
                        },
                    );
                }
                redundant_ops = replayed.redundant_ops;

                if replayed.torn_tail || !replayed.abandoned.is_empty() {
                    info!(
                        directory = ?directory,
                        abandoned = replayed.abandoned.len(),
                        torn_tail = replayed.torn_tail,
                        "Recovered from interrupted writes"
                    );
                    let records = entries
                        .iter()
                        .rev()
                        .map(|(id, e)| Record::Clean(id.clone(), e.lengths.clone()));
                    journal::rewrite(&directory, header, records)?;
                    redundant_ops = 0;
                }
            }
            Ok(None) => {
                journal::rewrite(&directory, header, Vec::new())?;
            }
            Err(e) => {
                warn!(directory = ?directory, error = %e, "Discarding unreadable cache journal");
                wipe_directory(&directory)?;
                journal::rewrite(&directory, header, Vec::new())?;
            }
        }

        let journal = JournalWriter::open(&directory)?;
        info!(
            directory = ?directory,
            entries = entries.len(),
            size,
            max_size = config.max_size,
            "Disk cache opened"
        );

        let state = State {
            entries,
            journal: Some(journal),
            size,
            max_size: config.max_size,
            redundant_ops,
            next_sequence_number: 1,
            next_edit_token: 1,
            lock_file: Some(lock_file),
        };
        let inner = Arc::new(Inner {
            directory,
            header,
            state: Mutex::new(state),
        });

        {
            let mut state = inner.state.lock();
            inner.cleanup(&mut state);
        }

        Ok(Self { inner })
    }

    /// Start editing an entry. `Ok(None)` if another editor is already open.
    pub fn edit(&self, id: &EntryId) -> Result<Option<Editor>> {
        Inner::edit(&self.inner, id, None)
    }

    /// Read the committed value of an entry and mark it most recently used
    pub fn get(&self, id: &EntryId) -> Result<Option<Snapshot>> {
        Inner::get(&self.inner, id)
    }

    /// Delete an entry. Returns `false` if it is absent or being edited.
    pub fn remove(&self, id: &EntryId) -> Result<bool> {
        let mut state = self.inner.state.lock();
        state.check_open()?;
        let removed = self.inner.remove_entry(&mut state, id)?;
        if state.needs_compaction() {
            self.inner.cleanup(&mut state);
        }
        Ok(removed)
    }

    /// Whether a committed value exists, without touching recency
    pub fn contains(&self, id: &EntryId) -> bool {
        let state = self.inner.state.lock();
        state
            .entries
            .peek(id)
            .map(|e| e.readable)
            .unwrap_or(false)
    }

    /// Bytes currently stored in committed slot files
    pub fn size(&self) -> u64 {
        self.inner.state.lock().size
    }

    pub fn max_size(&self) -> u64 {
        self.inner.state.lock().max_size
    }

    /// Change the budget, evicting immediately if the store is now over it
    pub fn set_max_size(&self, max_size: u64) -> Result<()> {
        if max_size == 0 {
            return Err(DiskCacheError::InvalidConfig(
                "max size must be positive".to_string(),
            ));
        }
        let mut state = self.inner.state.lock();
        state.check_open()?;
        state.max_size = max_size;
        self.inner.trim_to_size(&mut state)
    }

    /// Number of readable entries
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state.entries.iter().filter(|(_, e)| e.readable).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    pub fn slot_count(&self) -> usize {
        self.inner.header.slot_count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().journal.is_none()
    }

    /// Evict least recently used entries until the store fits its budget
    pub fn trim_to_size(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.check_open()?;
        self.inner.trim_to_size(&mut state)
    }

    /// Delete every entry and start over with an empty journal.
    /// Editors open at this point can no longer commit.
    ///
    /// The table is emptied even if deleting files or writing the new
    /// journal fails, and the store stays open. Files that survive a failed
    /// wipe are unreferenced and go with the next clear or cold start.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.check_open()?;

        state.entries.clear();
        state.size = 0;
        state.redundant_ops = 0;

        let dir = &self.inner.directory;
        let wiped = wipe_directory(dir);
        if let Err(e) = &wiped {
            warn!(directory = ?dir, error = %e, "Failed to delete cache files");
        }
        state
            .journal
            .as_mut()
            .ok_or(DiskCacheError::Closed)?
            .rebuild(self.inner.header, Vec::new())?;
        wiped?;

        info!(directory = ?dir, "Disk cache cleared");
        Ok(())
    }

    /// Trim and force the journal to stable storage
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.check_open()?;
        self.inner.trim_to_size(&mut state)?;
        state
            .journal
            .as_mut()
            .ok_or(DiskCacheError::Closed)?
            .sync()
    }

    /// Flush and close the journal and release the directory lock.
    /// Temp files of editors still open are discarded by the next `open`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.journal.is_none() {
            return Ok(());
        }
        if let Err(e) = self.inner.trim_to_size(&mut state) {
            warn!(error = %e, "Failed to trim disk cache on close");
        }
        let result = match state.journal.take() {
            Some(mut journal) => journal.sync(),
            None => Ok(()),
        };
        if let Some(lock_file) = state.lock_file.take() {
            let _ = lock_file.unlock();
        }
        info!(directory = ?self.inner.directory, "Disk cache closed");
        result
    }
}

impl Inner {
    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.header.slot_count
    }

    /// Open an editor. With `expected_sequence` set, fail unless the entry is
    /// still at that committed generation.
    pub(crate) fn edit(
        this: &Arc<Self>,
        id: &EntryId,
        expected_sequence: Option<u64>,
    ) -> Result<Option<Editor>> {
        let mut guard = this.state.lock();
        let state = &mut *guard;
        state.check_open()?;

        let existing = state
            .entries
            .peek(id)
            .map(|e| (e.editor.is_some(), e.sequence_number));
        match (existing, expected_sequence) {
            (Some((true, _)), _) => {
                debug!(id = %id, "Entry is already being edited");
                return Ok(None);
            }
            (Some((false, current)), Some(expected)) if current != expected => {
                return Ok(None);
            }
            (None, Some(_)) => return Ok(None),
            _ => {}
        }

        let token = state.next_edit_token;
        state.next_edit_token += 1;

        let created = match state.entries.peek_mut(id) {
            Some(entry) => {
                entry.editor = Some(token);
                false
            }
            None => {
                state.entries.put(
                    id.clone(),
                    Entry {
                        lengths: vec![0; this.header.slot_count],
                        readable: false,
                        editor: Some(token),
                        sequence_number: 0,
                    },
                );
                true
            }
        };

        if let Err(e) = state.append(&Record::Dirty(id.clone())) {
            if created {
                state.entries.pop(id);
            } else if let Some(entry) = state.entries.peek_mut(id) {
                entry.editor = None;
            }
            return Err(e);
        }

        Ok(Some(Editor::new(this.clone(), id.clone(), token)))
    }

    fn get(this: &Arc<Self>, id: &EntryId) -> Result<Option<Snapshot>> {
        let mut state = this.state.lock();
        state.check_open()?;

        let (lengths, sequence_number) = match state.entries.peek(id) {
            Some(entry) if entry.readable => (entry.lengths.clone(), entry.sequence_number),
            _ => return Ok(None),
        };

        let mut files = Vec::with_capacity(lengths.len());
        for slot in 0..lengths.len() {
            match File::open(clean_path(&this.directory, id, slot)) {
                Ok(file) => files.push(file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(id = %id, slot, "Committed slot file is missing");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        state.redundant_ops += 1;
        state.entries.promote(id);
        if let Err(e) = state.append(&Record::Read(id.clone())) {
            warn!(id = %id, error = %e, "Failed to journal read");
        }
        if state.needs_compaction() {
            this.cleanup(&mut state);
        }

        Ok(Some(Snapshot::new(
            this.clone(),
            id.clone(),
            sequence_number,
            files,
            lengths,
        )))
    }

    /// Finish an edit, publishing its slot files if `success`
    pub(crate) fn complete_edit(
        &self,
        id: &EntryId,
        token: u64,
        written: &[bool],
        success: bool,
    ) -> Result<()> {
        let slot_count = self.header.slot_count;
        let mut state = self.state.lock();
        let closed = state.journal.is_none();

        let (readable, old_lengths) = match state.entries.peek(id) {
            Some(entry) if !closed && entry.editor == Some(token) => {
                (entry.readable, entry.lengths.clone())
            }
            _ => {
                // Invalidated by clear() or close()
                self.remove_dirty_files(id, token);
                return Err(if closed {
                    DiskCacheError::Closed
                } else {
                    DiskCacheError::KeyEditConflict(id.to_string())
                });
            }
        };

        let mut success = success;
        let mut failure = None;
        if success && !readable {
            if let Some(slot) = written.iter().position(|w| !w) {
                success = false;
                failure = Some(DiskCacheError::IncompleteEdit {
                    id: id.to_string(),
                    slot,
                });
            }
        }

        let mut new_lengths = old_lengths.clone();
        let mut replaced = 0;
        if success {
            for (slot, _) in written.iter().enumerate().filter(|(_, w)| **w) {
                let clean = clean_path(&self.directory, id, slot);
                let renamed = fs::rename(dirty_path(&self.directory, id, slot, token), &clean)
                    .and_then(|_| fs::metadata(&clean));
                match renamed {
                    Ok(meta) => {
                        new_lengths[slot] = meta.len();
                        replaced += 1;
                    }
                    Err(e) => {
                        warn!(id = %id, slot, error = %e, "Failed to publish slot file");
                        failure = Some(e.into());
                        success = false;
                        break;
                    }
                }
            }
        }
        self.remove_dirty_files(id, token);
        state.redundant_ops += 1;

        let old_size: u64 = old_lengths.iter().sum();
        if success {
            let new_size: u64 = new_lengths.iter().sum();
            state.size = state.size.saturating_sub(old_size) + new_size;
            let sequence_number = state.next_sequence_number;
            state.next_sequence_number += 1;
            if let Some(entry) = state.entries.get_mut(id) {
                entry.readable = true;
                entry.editor = None;
                entry.lengths = new_lengths.clone();
                entry.sequence_number = sequence_number;
            }
            state.append(&Record::Clean(id.clone(), new_lengths))?;
            debug!(id = %id, size = new_size, "Committed entry");
        } else if replaced > 0 {
            // Part of the old generation is already overwritten; drop it all
            for slot in 0..slot_count {
                remove_if_exists(&clean_path(&self.directory, id, slot))?;
            }
            state.size = state.size.saturating_sub(old_size);
            state.entries.pop(id);
            state.append(&Record::Remove(id.clone()))?;
        } else if readable {
            if let Some(entry) = state.entries.get_mut(id) {
                entry.editor = None;
            }
            state.append(&Record::Clean(id.clone(), old_lengths))?;
        } else {
            state.entries.pop(id);
            state.append(&Record::Remove(id.clone()))?;
        }

        if state.size > state.max_size || state.needs_compaction() {
            self.cleanup(&mut state);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn remove_entry(&self, state: &mut State, id: &EntryId) -> Result<bool> {
        let lengths = match state.entries.peek(id) {
            Some(entry) if entry.editor.is_none() => entry.lengths.clone(),
            _ => return Ok(false),
        };

        for slot in 0..lengths.len() {
            remove_if_exists(&clean_path(&self.directory, id, slot))?;
        }
        state.size = state.size.saturating_sub(lengths.iter().sum());
        state.redundant_ops += 1;
        state.entries.pop(id);
        state.append(&Record::Remove(id.clone()))?;
        Ok(true)
    }

    fn trim_to_size(&self, state: &mut State) -> Result<()> {
        while state.size > state.max_size {
            // Least recently used first; entries under edit are never evicted
            let victim = state
                .entries
                .iter()
                .rev()
                .find(|(_, e)| e.editor.is_none())
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    self.remove_entry(state, &id)?;
                    debug!(id = %id, size = state.size, "Evicted least recently used entry");
                }
                None => {
                    debug!(
                        size = state.size,
                        max_size = state.max_size,
                        "Only entries under edit remain, stopping eviction"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Rewrite the journal as the minimal description of the current table
    fn compact(&self, state: &mut State) -> Result<()> {
        let records: Vec<Record> = state
            .entries
            .iter()
            .rev()
            .map(|(id, e)| {
                if e.editor.is_some() {
                    Record::Dirty(id.clone())
                } else {
                    Record::Clean(id.clone(), e.lengths.clone())
                }
            })
            .collect();
        let redundant = state.redundant_ops;
        state
            .journal
            .as_mut()
            .ok_or(DiskCacheError::Closed)?
            .rebuild(self.header, records)?;
        state.redundant_ops = 0;
        info!(
            entries = state.entries.len(),
            redundant,
            "Compacted cache journal"
        );
        Ok(())
    }

    fn cleanup(&self, state: &mut State) {
        if let Err(e) = self.trim_to_size(state) {
            warn!(error = %e, "Failed to trim disk cache");
        }
        if state.needs_compaction() {
            if let Err(e) = self.compact(state) {
                warn!(error = %e, "Failed to compact cache journal");
            }
        }
    }

    fn remove_dirty_files(&self, id: &EntryId, token: u64) {
        for slot in 0..self.header.slot_count {
            let path = dirty_path(&self.directory, id, slot, token);
            if let Err(e) = remove_if_exists(&path) {
                warn!(path = ?path, error = %e, "Failed to delete temp file");
            }
        }
    }
}

pub(crate) fn clean_path(dir: &Path, id: &EntryId, slot: usize) -> PathBuf {
    dir.join(format!("{}.{}", id, slot))
}

pub(crate) fn dirty_path(dir: &Path, id: &EntryId, slot: usize, token: u64) -> PathBuf {
    dir.join(format!("{}.{}.{}{}", id, slot, token, TMP_SUFFIX))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_temp_files(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(TMP_SUFFIX))
            .unwrap_or(false);
        if is_temp && path.is_file() {
            remove_if_exists(&path)?;
        }
    }
    Ok(())
}

/// Delete everything in the directory except the lock file
fn wipe_directory(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name() == LOCK_FILE {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            remove_if_exists(&path)?;
        }
    }
    Ok(())
}
