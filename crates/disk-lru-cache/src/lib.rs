//! Journaled, size-bounded LRU cache of multi-slot byte values on disk
//!
//! Entries are addressed by [`EntryId`], a filesystem-safe digest of the
//! caller's key. Each entry holds a fixed number of slot files. Writes go
//! through an [`Editor`] and become visible atomically on commit; reads hand
//! out a [`Snapshot`] of open file handles. An append-only journal records
//! every state change so the table and its recency order survive restarts.

mod editor;
mod error;
pub mod journal;
mod key;
mod snapshot;
mod store;

pub use editor::Editor;
pub use error::{DiskCacheError, Result};
pub use journal::REDUNDANT_OP_THRESHOLD;
pub use key::EntryId;
pub use snapshot::Snapshot;
pub use store::{DiskStore, DiskStoreConfig};
