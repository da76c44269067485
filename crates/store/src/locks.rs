use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Per-fileHash reader/writer locks.
///
/// Chunk writes hold the lock for their hash shared, merges hold it
/// exclusively. Entries are dropped once no guard or waiter references them.
#[derive(Debug, Default)]
pub struct NamespaceLocks {
    locks: Mutex<HashMap<String, Weak<RwLock<()>>>>,
}

impl NamespaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, file_hash: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap();
        if let Some(lock) = locks.get(file_hash).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(RwLock::new(()));
        locks.insert(file_hash.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Shared guard for writing chunks of `file_hash`.
    pub async fn write_chunk(&self, file_hash: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(file_hash).read_owned().await
    }

    /// Exclusive guard for merging `file_hash`.
    pub async fn merge(&self, file_hash: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(file_hash).write_owned().await
    }

    /// Number of hashes with a live lock.
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn chunk_writers_share_the_lock() {
        let locks = NamespaceLocks::new();
        let _a = locks.write_chunk("h").await;
        let _b = locks.write_chunk("h").await;
        assert_eq!(locks.active(), 1);
    }

    #[tokio::test]
    async fn merge_waits_for_chunk_writers() {
        let locks = Arc::new(NamespaceLocks::new());
        let writer = locks.write_chunk("h").await;

        let merging = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.merge("h").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!merging.is_finished());

        drop(writer);
        tokio::time::timeout(Duration::from_secs(1), merging)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_hashes_do_not_contend() {
        let locks = NamespaceLocks::new();
        let _merge = locks.merge("a").await;
        tokio::time::timeout(Duration::from_millis(100), locks.write_chunk("b"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn released_locks_are_pruned() {
        let locks = NamespaceLocks::new();
        drop(locks.merge("a").await);
        assert_eq!(locks.active(), 0);
        let _b = locks.merge("b").await;
        assert_eq!(locks.active(), 1);
    }
}
