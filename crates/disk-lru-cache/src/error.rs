//! Error types for the disk LRU cache

use std::fmt;

#[derive(Debug)]
pub enum DiskCacheError {
    Io(Box<std::io::Error>),
    /// A journal line could not be parsed
    CorruptJournal(String),
    /// Another editor is open for the entry, or the editor was invalidated
    KeyEditConflict(String),
    NotFound(String),
    InvalidSlot { slot: usize, slot_count: usize },
    /// A new entry was committed without a value for every slot
    IncompleteEdit { id: String, slot: usize },
    InvalidConfig(String),
    /// The directory is held by another open store
    Locked(String),
    Closed,
}

impl fmt::Display for DiskCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskCacheError::Io(err) => write!(f, "IO error: {}", err),
            DiskCacheError::CorruptJournal(msg) => write!(f, "Corrupt journal: {}", msg),
            DiskCacheError::KeyEditConflict(id) => {
                write!(f, "Entry {} is already being edited", id)
            }
            DiskCacheError::NotFound(key) => write!(f, "No cache entry for {}", key),
            DiskCacheError::InvalidSlot { slot, slot_count } => {
                write!(f, "Slot {} out of range (entries have {} slots)", slot, slot_count)
            }
            DiskCacheError::IncompleteEdit { id, slot } => {
                write!(f, "New entry {} did not write slot {}", id, slot)
            }
            DiskCacheError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            DiskCacheError::Locked(dir) => write!(f, "Cache directory {} is locked", dir),
            DiskCacheError::Closed => write!(f, "Cache is closed"),
        }
    }
}

impl std::error::Error for DiskCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiskCacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DiskCacheError {
    fn from(err: std::io::Error) -> Self {
        DiskCacheError::Io(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, DiskCacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_journal_display() {
        let err = DiskCacheError::CorruptJournal("unknown op FOO".to_string());
        assert_eq!(format!("{}", err), "Corrupt journal: unknown op FOO");
    }

    #[test]
    fn test_invalid_slot_display() {
        let err = DiskCacheError::InvalidSlot {
            slot: 3,
            slot_count: 2,
        };
        assert_eq!(
            format!("{}", err),
            "Slot 3 out of range (entries have 2 slots)"
        );
    }

    #[test]
    fn test_io_error_has_source() {
        let err: DiskCacheError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(std::error::Error::source(&err).is_some());
        assert!(format!("{}", err).contains("gone"));
    }

    #[test]
    fn test_error_is_debug() {
        let err = DiskCacheError::Closed;
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Closed"));
    }
}
