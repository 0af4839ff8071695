//! Named async locks serializing mutations per application and per deployment.
//!
//! Locks are created lazily on first use; `init` pre-creates them for the
//! objects already in the store when the scheduler becomes master.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Pool of per-key async mutexes.
#[derive(Debug, Default)]
pub struct LockPool {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create locks for `keys`.
    pub fn init<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            locks.entry(key.into()).or_default();
        }
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Wait for and take the lock for `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Take the lock for `key` only if it is free.
    pub fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }

    /// Drop the lock entry for a deleted object. Holders keep their guard.
    pub fn remove(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.remove(key);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let pool = LockPool::new();
        let guard = pool.lock("ns/web").await;
        assert!(pool.try_lock("ns/web").is_none());
        assert!(pool.try_lock("ns/api").is_some());
        drop(guard);
        assert!(pool.try_lock("ns/web").is_some());
    }

    #[tokio::test]
    async fn waiter_acquires_after_release() {
        let pool = Arc::new(LockPool::new());
        let guard = pool.lock("ns/web").await;

        let p = pool.clone();
        let waiter = tokio::spawn(async move {
            let _g = p.lock("ns/web").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn init_precreates_entries() {
        let pool = LockPool::new();
        pool.init(["ns/a", "ns/b"]);
        assert_eq!(pool.len(), 2);
        pool.remove("ns/a");
        assert_eq!(pool.len(), 1);
    }
}
