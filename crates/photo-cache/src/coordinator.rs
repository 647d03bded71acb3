//! Two-tier cache front end
//!
//! Routes reads and writes across the memory and disk tiers according to
//! the configured [`CacheMode`]. Disk work runs on the blocking thread pool.

use crate::config::{CacheConfig, CacheMode};
use crate::error::{CacheError, Result};
use crate::memory::MemoryStore;
use crate::types::CacheStats;
use crate::value::{CacheValue, Image, ValueHeader, Weighted, HEADER_SLOT, PAYLOAD_SLOT};
use chrono::{DateTime, Utc};
use disk_lru_cache::{DiskCacheError, DiskStore, DiskStoreConfig, EntryId};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: CacheValue,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

impl Weighted for MemoryEntry {
    fn weight(&self) -> u64 {
        self.value.weight()
    }
}

/// Owns both tiers and is the only writer to either
pub struct CacheCoordinator {
    mode: CacheMode,
    memory: Option<MemoryStore<MemoryEntry>>,
    disk: Option<DiskStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> disk_lru_cache::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

impl CacheCoordinator {
    /// Build the tiers the mode asks for, opening (and recovering) the disk
    /// store if there is one
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let memory = config
            .mode
            .uses_memory()
            .then(|| MemoryStore::new(config.max_memory_bytes));

        let disk = if config.mode.uses_disk() {
            let disk_config =
                DiskStoreConfig::new(config.disk_directory.clone(), config.max_disk_bytes)
                    .with_schema_version(config.schema_version)
                    .with_slot_count(config.value_slot_count);
            Some(blocking(move || DiskStore::open(disk_config)).await?)
        } else {
            None
        };

        info!(
            mode = %config.mode,
            max_memory = config.max_memory_bytes,
            max_disk = config.max_disk_bytes,
            directory = ?config.disk_directory,
            "Cache ready"
        );

        Ok(Self {
            mode: config.mode,
            memory,
            disk,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Store a value with no expiry.
    ///
    /// In `Both` mode a failed disk write is logged and the value is still
    /// cached in memory. In `DiskOnly` mode the disk error is returned.
    pub async fn put(&self, key: &str, value: CacheValue) -> Result<()> {
        self.put_entry(key, value, None).await
    }

    /// Store a value that reads as a miss once `ttl` has passed
    pub async fn put_with_ttl(&self, key: &str, value: CacheValue, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CacheError::Config(format!("ttl out of range: {}", e)))?;
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| CacheError::Config("ttl out of range".to_string()))?;
        self.put_entry(key, value, Some(expires_at)).await
    }

    async fn put_entry(
        &self,
        key: &str,
        value: CacheValue,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(disk) = &self.disk {
            match self.write_disk(disk, key, &value, expires_at).await {
                Ok(()) => {}
                Err(e) if self.mode == CacheMode::Both => {
                    warn!(key, error = %e, "Disk write failed, keeping value in memory only");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(memory) = &self.memory {
            memory.put(key, MemoryEntry { value, expires_at });
        }
        Ok(())
    }

    async fn write_disk(
        &self,
        disk: &DiskStore,
        key: &str,
        value: &CacheValue,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let (header, payload) = value.encode(expires_at)?;
        let header = serde_json::to_vec(&header)?;
        let disk = disk.clone();
        let id = EntryId::from_key(key);

        blocking(move || {
            let mut editor = disk
                .edit(&id)?
                .ok_or_else(|| DiskCacheError::KeyEditConflict(id.to_string()))?;
            editor.write(HEADER_SLOT, &header)?;
            editor.write(PAYLOAD_SLOT, &payload)?;
            for slot in PAYLOAD_SLOT + 1..disk.slot_count() {
                editor.write(slot, &[])?;
            }
            editor.commit()
        })
        .await
    }

    /// Look a key up in memory, then on disk. A disk hit is copied into
    /// memory. Expired and unreadable entries are dropped and read as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let now = Utc::now();

        if let Some(memory) = &self.memory {
            if let Some(entry) = memory.get(key) {
                if entry.is_expired(now) {
                    self.drop_entry(key, "expired").await;
                    return Ok(self.miss(key));
                }
                return Ok(self.hit(key, "memory", entry.value));
            }
        }

        if let Some(disk) = &self.disk {
            match self.read_disk(disk, key).await {
                Ok(Some((header, value))) => {
                    if header.is_expired(now) {
                        self.drop_entry(key, "expired").await;
                        return Ok(self.miss(key));
                    }
                    if let Some(memory) = &self.memory {
                        memory.put(
                            key,
                            MemoryEntry {
                                value: value.clone(),
                                expires_at: header.expires_at,
                            },
                        );
                    }
                    return Ok(self.hit(key, "disk", value));
                }
                Ok(None) => {}
                Err(e @ CacheError::Serialization(_)) => {
                    warn!(key, error = %e, "Dropping undecodable disk entry");
                    self.drop_entry(key, "undecodable").await;
                }
                Err(e) => {
                    warn!(key, error = %e, "Disk read failed, treating as a miss");
                }
            }
        }

        Ok(self.miss(key))
    }

    async fn read_disk(&self, disk: &DiskStore, key: &str) -> Result<Option<(ValueHeader, CacheValue)>> {
        let disk = disk.clone();
        let id = EntryId::from_key(key);

        let raw = blocking(move || {
            let mut snapshot = match disk.get(&id)? {
                Some(snapshot) => snapshot,
                None => return Ok(None),
            };
            let header = snapshot.read(HEADER_SLOT)?;
            let payload = snapshot.read(PAYLOAD_SLOT)?;
            Ok(Some((header, payload)))
        })
        .await?;

        match raw {
            Some((header, payload)) => {
                let header: ValueHeader = serde_json::from_slice(&header)?;
                let value = CacheValue::decode(&header, payload)?;
                Ok(Some((header, value)))
            }
            None => Ok(None),
        }
    }

    pub async fn get_text(&self, key: &str) -> Result<Option<String>> {
        self.get(key).await?.map(CacheValue::into_text).transpose()
    }

    /// Bytes of a binary or image value
    pub async fn get_binary(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get(key).await?.map(CacheValue::into_binary).transpose()
    }

    pub async fn get_structured<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .await?
            .map(CacheValue::into_structured::<T>)
            .transpose()
    }

    pub async fn get_image(&self, key: &str) -> Result<Option<Image>> {
        self.get(key).await?.map(CacheValue::into_image).transpose()
    }

    /// Whether any tier holds the key. Does not touch recency, and does not
    /// notice expiry until the entry is read.
    pub fn contains(&self, key: &str) -> bool {
        let in_memory = self
            .memory
            .as_ref()
            .map(|m| m.contains(key))
            .unwrap_or(false);
        in_memory
            || self
                .disk
                .as_ref()
                .map(|d| d.contains(&EntryId::from_key(key)))
                .unwrap_or(false)
    }

    /// Remove from every tier. `true` if any tier had the key.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut removed = self
            .memory
            .as_ref()
            .map(|m| m.remove(key))
            .unwrap_or(false);

        if let Some(disk) = &self.disk {
            let disk = disk.clone();
            let id = EntryId::from_key(key);
            removed |= blocking(move || disk.remove(&id)).await?;
        }
        Ok(removed)
    }

    async fn drop_entry(&self, key: &str, reason: &str) {
        debug!(key, reason, "Dropping cache entry");
        if let Err(e) = self.remove(key).await {
            warn!(key, error = %e, "Failed to drop cache entry");
        }
    }

    pub async fn clear(&self) -> Result<()> {
        if let Some(memory) = &self.memory {
            memory.clear();
        }
        if let Some(disk) = &self.disk {
            let disk = disk.clone();
            blocking(move || disk.clear()).await?;
        }
        info!(mode = %self.mode, "Cache cleared");
        Ok(())
    }

    /// Bytes held across both tiers
    pub fn size(&self) -> u64 {
        self.memory_size() + self.disk_size()
    }

    fn memory_size(&self) -> u64 {
        self.memory.as_ref().map(|m| m.size()).unwrap_or(0)
    }

    fn disk_size(&self) -> u64 {
        self.disk.as_ref().map(|d| d.size()).unwrap_or(0)
    }

    /// Force the disk journal to stable storage
    pub async fn flush(&self) -> Result<()> {
        if let Some(disk) = &self.disk {
            let disk = disk.clone();
            blocking(move || disk.flush()).await?;
        }
        Ok(())
    }

    /// Close the disk tier and empty the memory tier
    pub async fn close(&self) -> Result<()> {
        if let Some(memory) = &self.memory {
            memory.clear();
        }
        if let Some(disk) = &self.disk {
            let disk = disk.clone();
            blocking(move || disk.close()).await?;
        }
        info!(mode = %self.mode, "Cache closed");
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let memory_entries = self.memory.as_ref().map(|m| m.len()).unwrap_or(0);
        let disk_entries = self.disk.as_ref().map(|d| d.len()).unwrap_or(0);
        let memory_size = self.memory_size();
        let disk_size = self.disk_size();

        CacheStats {
            mode: Some(self.mode),
            // the memory tier mirrors the disk tier in Both mode
            entries: memory_entries.max(disk_entries),
            total_size: memory_size + disk_size,
            memory_entries,
            memory_size,
            disk_entries,
            disk_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn hit(&self, key: &str, tier: &str, value: CacheValue) -> Option<CacheValue> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key, tier, "Cache hit");
        Some(value)
    }

    fn miss(&self, key: &str) -> Option<CacheValue> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "Cache miss");
        None
    }
}
