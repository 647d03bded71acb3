//! Transactional write handle for one entry

use crate::error::{DiskCacheError, Result};
use crate::key::EntryId;
use crate::store::{dirty_path, Inner};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tracing::warn;

/// Writes the slots of one entry.
///
/// Nothing is visible to readers until [`Editor::commit`]. An editor that is
/// dropped without being committed or aborted is aborted, so the previous
/// committed value (if any) stays intact.
pub struct Editor {
    store: Arc<Inner>,
    id: EntryId,
    token: u64,
    writers: Vec<Option<BufWriter<File>>>,
    written: Vec<bool>,
    error: Option<std::io::Error>,
    done: bool,
}

impl Editor {
    pub(crate) fn new(store: Arc<Inner>, id: EntryId, token: u64) -> Self {
        let slot_count = store.slot_count();
        Self {
            store,
            id,
            token,
            writers: (0..slot_count).map(|_| None).collect(),
            written: vec![false; slot_count],
            error: None,
            done: false,
        }
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    /// Append bytes to a slot. The first write to a slot replaces its value.
    pub fn write(&mut self, slot: usize, bytes: &[u8]) -> Result<()> {
        let slot_count = self.writers.len();
        let writer = match self.writers.get_mut(slot) {
            Some(writer) => writer,
            None => return Err(DiskCacheError::InvalidSlot { slot, slot_count }),
        };

        if writer.is_none() {
            let path = dirty_path(self.store.directory(), &self.id, slot, self.token);
            match File::create(&path) {
                Ok(file) => *writer = Some(BufWriter::new(file)),
                Err(e) => {
                    let err = std::io::Error::new(e.kind(), e.to_string());
                    self.error.get_or_insert(e);
                    return Err(err.into());
                }
            }
        }
        self.written[slot] = true;

        if let Some(w) = writer.as_mut() {
            if let Err(e) = w.write_all(bytes) {
                let err = std::io::Error::new(e.kind(), e.to_string());
                self.error.get_or_insert(e);
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Publish the written slots. Slots never written keep their previous
    /// value; a brand-new entry must write every slot.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.close_writers();

        // A failed write never reached the slot files, so the previous
        // generation is still intact
        if let Some(e) = self.error.take() {
            warn!(id = %self.id, error = %e, "Aborting edit after failed write");
            let _ = self
                .store
                .complete_edit(&self.id, self.token, &self.written, false);
            return Err(e.into());
        }

        self.store
            .complete_edit(&self.id, self.token, &self.written, true)
    }

    /// Throw away everything written through this editor
    pub fn abort(mut self) -> Result<()> {
        self.done = true;
        self.writers.clear();
        self.store
            .complete_edit(&self.id, self.token, &self.written, false)
    }

    fn close_writers(&mut self) {
        for writer in self.writers.drain(..).flatten() {
            let synced = writer
                .into_inner()
                .map_err(|e| e.into_error())
                .and_then(|file| file.sync_data());
            if let Err(e) = synced {
                self.error.get_or_insert(e);
            }
        }
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.writers.clear();
        match self
            .store
            .complete_edit(&self.id, self.token, &self.written, false)
        {
            Ok(()) | Err(DiskCacheError::Closed) => {}
            Err(e) => warn!(id = %self.id, error = %e, "Failed to abort abandoned edit"),
        }
    }
}
