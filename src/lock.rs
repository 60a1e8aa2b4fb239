// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster-wide refresh lock.
//!
//! A single key holding the holder's random token. Acquisition is
//! set-if-absent with a TTL so a crashed holder frees the slot on its own;
//! release is compare-and-delete so a holder whose TTL already lapsed can
//! never remove a lock that now belongs to someone else.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::metrics::{self, LatencyTimer};
use crate::storage::traits::{CacheBackend, StorageError};

pub struct RefreshLock {
    backend: Arc<dyn CacheBackend>,
    key: String,
}

impl RefreshLock {
    pub fn new(backend: Arc<dyn CacheBackend>, key: impl Into<String>) -> Self {
        Self { backend, key: key.into() }
    }

    /// Try to take the lock with `token`. `Ok(false)` means someone else holds it.
    pub async fn try_acquire(&self, token: &str, ttl: Duration) -> Result<bool, StorageError> {
        let _timer = LatencyTimer::new("lock", "acquire");
        let acquired = self
            .backend
            .set_nx_with_ttl(&self.key, token, ttl)
            .await
            .inspect_err(|_| metrics::record_error("lock", "acquire"))?;
        debug!(key = %self.key, acquired, "Refresh lock acquire attempt");
        Ok(acquired)
    }

    /// Release the lock if `token` still holds it.
    ///
    /// Returns [`StorageError::LockNotHeld`] when the lock is absent or held
    /// by another token; the lock is left untouched in that case.
    pub async fn release(&self, token: &str) -> Result<(), StorageError> {
        let _timer = LatencyTimer::new("lock", "release");
        let released = self
            .backend
            .delete_if_equals(&self.key, token)
            .await
            .inspect_err(|_| metrics::record_error("lock", "release"))?;
        if released {
            Ok(())
        } else {
            warn!(key = %self.key, "Refresh lock not held by this token on release");
            Err(StorageError::LockNotHeld)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;

    const TTL: Duration = Duration::from_secs(60);

    fn lock() -> (Arc<MemoryBackend>, RefreshLock) {
        let backend = Arc::new(MemoryBackend::new());
        (backend.clone(), RefreshLock::new(backend, "active_ads_lock"))
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let (_, lock) = lock();
        assert!(lock.try_acquire("a", TTL).await.unwrap());
        lock.release("a").await.unwrap();
        assert!(lock.try_acquire("b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_acquire_fails_while_held() {
        let (_, lock) = lock();
        assert!(lock.try_acquire("a", TTL).await.unwrap());
        assert!(!lock.try_acquire("b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_release_leaves_lock_intact() {
        let (backend, lock) = lock();
        lock.try_acquire("owner", TTL).await.unwrap();

        let result = lock.release("intruder").await;
        assert!(matches!(result, Err(StorageError::LockNotHeld)));
        assert_eq!(backend.get("active_ads_lock").await.unwrap().as_deref(), Some("owner"));
    }

    #[tokio::test]
    async fn test_release_without_holder_fails() {
        let (_, lock) = lock();
        assert!(matches!(lock.release("nobody").await, Err(StorageError::LockNotHeld)));
    }

    #[tokio::test]
    async fn test_ttl_self_heals() {
        let (_, lock) = lock();
        assert!(lock.try_acquire("crashed", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(lock.try_acquire("next", TTL).await.unwrap());

        // The expired holder cannot release the new owner's lock
        assert!(matches!(lock.release("crashed").await, Err(StorageError::LockNotHeld)));
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let (backend, lock) = lock();
        backend.set_unavailable(true);
        assert!(matches!(lock.try_acquire("a", TTL).await, Err(StorageError::Backend(_))));
    }
}
