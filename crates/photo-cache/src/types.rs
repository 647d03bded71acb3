//! Cache types

use crate::config::CacheMode;
use serde::{Deserialize, Serialize};

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub mode: Option<CacheMode>,
    pub entries: usize,
    pub total_size: u64,
    pub memory_entries: usize,
    pub memory_size: u64,
    pub disk_entries: usize,
    pub disk_size: u64,
    pub hits: u64,
    pub misses: u64,
}
