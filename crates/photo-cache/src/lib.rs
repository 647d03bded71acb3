//! Two-tier cache for photo wall payloads
//!
//! A [`CacheCoordinator`] fronts a bounded in-process LRU tier and a
//! journaled on-disk tier (see the `disk-lru-cache` crate). Values are text,
//! raw bytes, JSON documents or encoded images.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod global;
pub mod memory;
pub mod types;
pub mod value;

pub use config::{CacheConfig, CacheMode};
pub use coordinator::CacheCoordinator;
pub use error::{CacheError, Result};
pub use global::{initialize, instance, shutdown};
pub use memory::MemoryStore;
pub use types::CacheStats;
pub use value::{CacheValue, Image, ValueHeader, ValueKind, Weighted};
