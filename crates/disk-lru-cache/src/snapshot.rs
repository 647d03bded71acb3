//! Read-only view of a committed entry

use crate::editor::Editor;
use crate::error::{DiskCacheError, Result};
use crate::key::EntryId;
use crate::store::Inner;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

/// Open handles to every slot of an entry as it was when read.
///
/// The handles stay readable even if the entry is replaced or evicted
/// afterwards (on platforms that allow deleting open files).
pub struct Snapshot {
    store: Arc<Inner>,
    id: EntryId,
    sequence_number: u64,
    files: Vec<File>,
    lengths: Vec<u64>,
}

impl Snapshot {
    pub(crate) fn new(
        store: Arc<Inner>,
        id: EntryId,
        sequence_number: u64,
        files: Vec<File>,
        lengths: Vec<u64>,
    ) -> Self {
        Self {
            store,
            id,
            sequence_number,
            files,
            lengths,
        }
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Committed length of a slot
    pub fn length(&self, slot: usize) -> Option<u64> {
        self.lengths.get(slot).copied()
    }

    pub fn lengths(&self) -> &[u64] {
        &self.lengths
    }

    /// Read a whole slot
    pub fn read(&mut self, slot: usize) -> Result<Vec<u8>> {
        let slot_count = self.files.len();
        let file = self
            .files
            .get_mut(slot)
            .ok_or(DiskCacheError::InvalidSlot { slot, slot_count })?;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(self.lengths[slot] as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Read a whole slot as UTF-8
    pub fn read_string(&mut self, slot: usize) -> Result<String> {
        let bytes = self.read(slot)?;
        String::from_utf8(bytes).map_err(|e| {
            DiskCacheError::from(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })
    }

    /// Edit the entry, unless it has been committed again since this
    /// snapshot was taken or is being edited right now
    pub fn edit(&self) -> Result<Option<Editor>> {
        Inner::edit(&self.store, &self.id, Some(self.sequence_number))
    }
}
