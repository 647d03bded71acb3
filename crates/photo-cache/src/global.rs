//! Process-wide cache handle
//!
//! The handle is installed explicitly with [`initialize`] and removed with
//! [`shutdown`]; nothing is constructed lazily.

use crate::config::CacheConfig;
use crate::coordinator::CacheCoordinator;
use crate::error::{CacheError, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

static INSTANCE: RwLock<Option<Arc<CacheCoordinator>>> = RwLock::new(None);
/// Serializes initialize and shutdown across the await on opening the disk tier
static LIFECYCLE: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Open a coordinator and install it as the process-wide cache
pub async fn initialize(config: CacheConfig) -> Result<Arc<CacheCoordinator>> {
    let _lifecycle = LIFECYCLE.lock().await;
    if INSTANCE.read().is_some() {
        return Err(CacheError::AlreadyInitialized);
    }

    let coordinator = Arc::new(CacheCoordinator::open(config).await?);
    *INSTANCE.write() = Some(coordinator.clone());

    info!(mode = %coordinator.mode(), "Process-wide cache installed");
    Ok(coordinator)
}

/// The installed coordinator
pub fn instance() -> Result<Arc<CacheCoordinator>> {
    INSTANCE.read().clone().ok_or(CacheError::NotInitialized)
}

/// Uninstall and close the process-wide cache
pub async fn shutdown() -> Result<()> {
    let _lifecycle = LIFECYCLE.lock().await;
    let coordinator = INSTANCE.write().take().ok_or(CacheError::NotInitialized)?;
    coordinator.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheMode;
    use crate::value::CacheValue;
    use tempfile::tempdir;

    // Single test: the handle is shared by every test in the binary
    #[tokio::test]
    async fn test_lifecycle() {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            mode: CacheMode::Both,
            max_memory_bytes: 1024,
            max_disk_bytes: 1024 * 1024,
            disk_directory: dir.path().to_path_buf(),
            schema_version: 1,
            value_slot_count: 2,
        };

        assert!(matches!(instance(), Err(CacheError::NotInitialized)));
        assert!(matches!(shutdown().await, Err(CacheError::NotInitialized)));

        // two racing callers: one installs the cache, the other is told so
        let (first, second) = tokio::join!(initialize(config.clone()), initialize(config.clone()));
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(CacheError::AlreadyInitialized))));
        assert!(matches!(
            initialize(config.clone()).await,
            Err(CacheError::AlreadyInitialized)
        ));

        let cache = instance().unwrap();
        cache
            .put("k", CacheValue::Text("v".to_string()))
            .await
            .unwrap();
        assert_eq!(
            instance().unwrap().get_text("k").await.unwrap().as_deref(),
            Some("v")
        );
        drop(cache);

        shutdown().await.unwrap();
        assert!(matches!(instance(), Err(CacheError::NotInitialized)));

        // the directory lock was released, so a new handle can take over
        initialize(config).await.unwrap();
        assert_eq!(
            instance().unwrap().get_text("k").await.unwrap().as_deref(),
            Some("v")
        );
        shutdown().await.unwrap();
    }
}
