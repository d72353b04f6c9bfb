//! Per-collection request serialization.
//!
//! Two requests from the same device may touch the same collection at once
//! (a foreground sync and a hanging ping). [`SyncLocks`] hands out one async
//! mutex per (device, user, collection) so sync-key advancement for a
//! collection happens one request at a time.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use eas_sync_types::{CollectionId, DeviceId, UserId};

type LockKey = (DeviceId, UserId, CollectionId);

/// Registry of per-collection locks.
#[derive(Debug, Default)]
pub struct SyncLocks {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

/// Held while a collection is being synchronized.
pub type CollectionGuard = OwnedMutexGuard<()>;

impl SyncLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, device: &DeviceId, user: &UserId, collection: &CollectionId) -> Arc<Mutex<()>> {
        let key = (device.clone(), user.clone(), collection.clone());
        Arc::clone(self.locks.entry(key).or_default().value())
    }

    /// Wait for exclusive access to a collection.
    pub async fn lock(
        &self,
        device: &DeviceId,
        user: &UserId,
        collection: &CollectionId,
    ) -> CollectionGuard {
        self.entry(device, user, collection).lock_owned().await
    }

    /// Take exclusive access if nobody holds it.
    pub fn try_lock(
        &self,
        device: &DeviceId,
        user: &UserId,
        collection: &CollectionId,
    ) -> Option<CollectionGuard> {
        self.entry(device, user, collection).try_lock_owned().ok()
    }

    /// Drop locks nobody holds or waits for.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    /// Number of registered locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check if no locks are registered.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key() -> (DeviceId, UserId, CollectionId) {
        ("dev123".into(), "mike".into(), "INBOX".into())
    }

    #[tokio::test]
    async fn same_collection_is_exclusive() {
        let locks = SyncLocks::new();
        let (d, u, c) = key();

        let guard = locks.lock(&d, &u, &c).await;
        assert!(locks.try_lock(&d, &u, &c).is_none());

        // Other collections are independent.
        assert!(locks.try_lock(&d, &u, &"Calendar".into()).is_some());

        drop(guard);
        assert!(locks.try_lock(&d, &u, &c).is_some());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = Arc::new(SyncLocks::new());
        let (d, u, c) = key();
        let guard = locks.lock(&d, &u, &c).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            let (d, u, c) = key();
            tokio::spawn(async move {
                let _guard = locks.lock(&d, &u, &c).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = SyncLocks::new();
        let (d, u, c) = key();
        let _held = locks.lock(&d, &u, &c).await;
        drop(locks.lock(&d, &u, &"Notes".into()).await);

        assert_eq!(locks.len(), 2);
        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
    }
}
