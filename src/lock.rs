//! Per-path advisory read/write lock registry used by the legacy
//! [`JsonBackend`](crate::storage::json_backend::JsonBackend).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// A registry of per-path advisory locks. Read locks share; write locks are
/// exclusive. A lock entry is released from the registry once no guard
/// references it any more.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquire a shared read lock on `path`, held for the returned guard's
    /// lifetime.
    pub async fn read(&self, path: &Path) -> OwnedRwLockReadGuard<()> {
        let lock = self.entry(path);
        lock.read_owned().await
    }

    /// Acquire an exclusive write lock on `path`, held for the returned
    /// guard's lifetime.
    pub async fn write(&self, path: &Path) -> OwnedRwLockWriteGuard<()> {
        let lock = self.entry(path);
        lock.write_owned().await
    }

    /// Drop any lock entries with no outstanding guards, so the registry
    /// does not grow unbounded across the process lifetime.
    pub fn prune(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_reads_do_not_block_each_other() {
        let registry = LockRegistry::new();
        let path = PathBuf::from("/tmp/x");
        let _g1 = registry.read(&path).await;
        let _g2 = registry.read(&path).await;
    }

    #[tokio::test]
    async fn write_excludes_concurrent_read() {
        let registry = Arc::new(LockRegistry::new());
        let path = PathBuf::from("/tmp/y");
        let guard = registry.write(&path).await;

        let registry2 = registry.clone();
        let path2 = path.clone();
        let handle = tokio::spawn(async move {
            let _g = registry2.read(&path2).await;
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(guard);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn prune_drops_unreferenced_entries() {
        let registry = LockRegistry::new();
        let path = PathBuf::from("/tmp/z");
        {
            let _g = registry.read(&path).await;
        }
        registry.prune();
        assert_eq!(registry.locks.lock().len(), 0);
    }
}
