//! Cache configuration and default budgets

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use sysinfo::System;

const MIB: u64 = 1024 * 1024;
const MIN_DISK_BYTES: u64 = 5 * MIB;
const MAX_DISK_BYTES: u64 = 20 * MIB;
/// Used when the platform does not report total memory
const FALLBACK_MEMORY_BYTES: u64 = 16 * MIB;

/// Which tiers a coordinator uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    MemoryOnly,
    DiskOnly,
    Both,
}

impl CacheMode {
    pub fn uses_memory(self) -> bool {
        matches!(self, CacheMode::MemoryOnly | CacheMode::Both)
    }

    pub fn uses_disk(self) -> bool {
        matches!(self, CacheMode::DiskOnly | CacheMode::Both)
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheMode::MemoryOnly => "memory_only",
            CacheMode::DiskOnly => "disk_only",
            CacheMode::Both => "both",
        };
        f.write_str(name)
    }
}

impl FromStr for CacheMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "memory_only" => Ok(CacheMode::MemoryOnly),
            "disk" | "disk_only" => Ok(CacheMode::DiskOnly),
            "both" | "all" => Ok(CacheMode::Both),
            other => Err(CacheError::Config(format!("unknown cache mode {:?}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub mode: CacheMode,
    pub max_memory_bytes: u64,
    pub max_disk_bytes: u64,
    pub disk_directory: PathBuf,
    /// Bump to discard everything written by an older build
    pub schema_version: u32,
    /// Slots per disk entry; the first two hold the header and payload
    pub value_slot_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let disk_directory = PathBuf::from("./cache/photowall");
        Self {
            mode: CacheMode::Both,
            max_memory_bytes: default_memory_budget(),
            max_disk_bytes: default_disk_budget(&disk_directory),
            disk_directory,
            schema_version: 1,
            value_slot_count: 2,
        }
    }
}

impl CacheConfig {
    /// Read overrides from `PHOTO_CACHE_*` environment variables.
    /// Unset or unparsable numbers fall back to the defaults.
    pub fn from_env() -> Result<Self> {
        let mode = match std::env::var("PHOTO_CACHE_MODE") {
            Ok(s) => s.parse()?,
            Err(_) => CacheMode::Both,
        };
        Self::from_env_with(mode, None)
    }

    /// Like [`CacheConfig::from_env`], but with the mode fixed and the
    /// directory optionally overridden. `PHOTO_CACHE_MODE` is not read, and
    /// the default disk budget is measured for the final directory.
    pub fn from_env_with(mode: CacheMode, directory: Option<PathBuf>) -> Result<Self> {
        let disk_directory = directory.unwrap_or_else(|| {
            std::env::var("PHOTO_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./cache/photowall"))
        });

        let max_memory_bytes = std::env::var("PHOTO_CACHE_MAX_MEMORY")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_else(default_memory_budget);

        let max_disk_bytes = std::env::var("PHOTO_CACHE_MAX_DISK")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_else(|| default_disk_budget(&disk_directory));

        let schema_version = std::env::var("PHOTO_CACHE_SCHEMA_VERSION")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(1);

        let config = Self {
            mode,
            max_memory_bytes,
            max_disk_bytes,
            disk_directory,
            schema_version,
            value_slot_count: 2,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode.uses_memory() && self.max_memory_bytes == 0 {
            return Err(CacheError::Config(
                "memory budget must be positive".to_string(),
            ));
        }
        if self.mode.uses_disk() {
            if self.max_disk_bytes == 0 {
                return Err(CacheError::Config("disk budget must be positive".to_string()));
            }
            if self.value_slot_count < 2 {
                return Err(CacheError::Config(format!(
                    "value slot count must be at least 2, got {}",
                    self.value_slot_count
                )));
            }
        }
        Ok(())
    }
}

/// One eighth of total system memory
pub fn default_memory_budget() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    match system.total_memory() {
        0 => FALLBACK_MEMORY_BYTES,
        total => total / 8,
    }
}

/// One fiftieth of the filesystem holding `directory`, clamped to 5..=20 MiB
pub fn default_disk_budget(directory: &Path) -> u64 {
    let total = existing_ancestor(directory)
        .and_then(|dir| fs2::total_space(dir).ok())
        .unwrap_or(0);
    (total / 50).clamp(MIN_DISK_BYTES, MAX_DISK_BYTES)
}

/// The directory may not exist yet; measure the closest parent that does
fn existing_ancestor(path: &Path) -> Option<&Path> {
    let mut current = if path.as_os_str().is_empty() {
        Path::new(".")
    } else {
        path
    };
    loop {
        if current.exists() {
            return Some(current);
        }
        current = match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            Some(_) if current != Path::new(".") => Path::new("."),
            _ => return None,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("both".parse::<CacheMode>().unwrap(), CacheMode::Both);
        assert_eq!(
            "Memory_Only".parse::<CacheMode>().unwrap(),
            CacheMode::MemoryOnly
        );
        assert_eq!(" disk ".parse::<CacheMode>().unwrap(), CacheMode::DiskOnly);
        assert!("tape".parse::<CacheMode>().is_err());
    }

    #[test]
    fn test_env_mode_and_directory_override() {
        let dir = tempdir().unwrap();
        let cache_dir = dir.path().join("photos");

        // the only test that touches PHOTO_CACHE_MODE
        std::env::set_var("PHOTO_CACHE_MODE", "tape");
        assert!(matches!(CacheConfig::from_env(), Err(CacheError::Config(_))));
        let config =
            CacheConfig::from_env_with(CacheMode::DiskOnly, Some(cache_dir.clone())).unwrap();
        std::env::remove_var("PHOTO_CACHE_MODE");

        assert_eq!(config.mode, CacheMode::DiskOnly);
        assert_eq!(config.disk_directory, cache_dir);
        if std::env::var("PHOTO_CACHE_MAX_DISK").is_err() {
            assert_eq!(config.max_disk_bytes, default_disk_budget(&cache_dir));
        }
    }

    #[test]
    fn test_mode_tiers() {
        assert!(CacheMode::Both.uses_memory() && CacheMode::Both.uses_disk());
        assert!(!CacheMode::MemoryOnly.uses_disk());
        assert!(!CacheMode::DiskOnly.uses_memory());
    }

    #[test]
    fn test_disk_budget_is_clamped() {
        let dir = tempdir().unwrap();
        let budget = default_disk_budget(&dir.path().join("not/created/yet"));
        assert!((MIN_DISK_BYTES..=MAX_DISK_BYTES).contains(&budget));
    }

    #[test]
    fn test_memory_budget_is_positive() {
        assert!(default_memory_budget() > 0);
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.mode, CacheMode::Both);
        assert_eq!(config.schema_version, 1);
        assert_eq!(config.value_slot_count, 2);
        assert_eq!(config.disk_directory, PathBuf::from("./cache/photowall"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_budgets() {
        let config = CacheConfig {
            mode: CacheMode::DiskOnly,
            max_memory_bytes: 0,
            max_disk_bytes: 1024,
            disk_directory: PathBuf::from("cache"),
            schema_version: 1,
            value_slot_count: 1,
        };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));

        let config = CacheConfig {
            value_slot_count: 2,
            ..config
        };
        // memory budget is irrelevant without the memory tier
        assert!(config.validate().is_ok());

        let config = CacheConfig {
            mode: CacheMode::Both,
            ..config
        };
        assert!(config.validate().is_err());
    }
}
