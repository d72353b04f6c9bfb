//! Background cleanup task for superseded sync keys.
//!
//! Runs periodically to drop sync-key rows older than the newest few of each
//! series, and to forget per-collection locks nobody holds.

use crate::config::CleanupConfig;
use crate::locks::SyncLocks;
use crate::storage::StateStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn a background cleanup task.
///
/// `keep_sync_keys` is the number of keys kept per series. Returns a handle
/// that can be used to abort the task.
pub fn spawn_cleanup_task<S: StateStorage + 'static>(
    storage: Arc<S>,
    locks: Arc<SyncLocks>,
    config: CleanupConfig,
    keep_sync_keys: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!(
            "Cleanup task started (interval: {}s, keeping {} keys per series)",
            interval_secs,
            keep_sync_keys
        );

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;

            match storage.gc_states(keep_sync_keys).await {
                Ok(removed) => {
                    if removed > 0 {
                        tracing::info!("Cleanup: removed {} superseded sync keys", removed);
                    } else {
                        tracing::debug!("Cleanup: no superseded sync keys");
                    }
                }
                Err(e) => {
                    tracing::error!("Cleanup error: {}", e);
                }
            }

            let pruned = locks.prune();
            if pruned > 0 {
                tracing::debug!("Cleanup: pruned {} idle collection locks", pruned);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockDriver;
    use crate::state::StateMachine;
    use crate::storage::SqliteStorage;
    use eas_sync_types::{CollectionId, DeviceId, SyncKey, UserId};

    fn machine(storage: &Arc<SqliteStorage>) -> StateMachine<SqliteStorage> {
        StateMachine::new(
            Arc::clone(storage),
            DeviceId::new("dev123"),
            UserId::new("mike"),
            CollectionId::new("INBOX"),
            "INBOX",
        )
    }

    /// Commit `rounds` keys of one series; returns every key issued.
    async fn commit_rounds(storage: &Arc<SqliteStorage>, rounds: usize) -> Vec<SyncKey> {
        let driver = MockDriver::new();
        driver.add_folder("INBOX");
        let mut keys = Vec::new();
        let mut key = SyncKey::Initial;
        for _ in 0..rounds {
            let mut state = machine(storage);
            state.load_state(&key).await.unwrap();
            state.get_changes(&driver, None).await.unwrap();
            key = state.get_new_sync_key();
            state.save().await.unwrap();
            keys.push(key.clone());
        }
        keys
    }

    #[tokio::test]
    async fn cleanup_task_removes_superseded_keys() {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let keys = commit_rounds(&storage, 4).await;

        let config = CleanupConfig {
            interval_secs: 3600,
            enabled: true,
        };
        // The first tick fires immediately.
        let handle = spawn_cleanup_task(Arc::clone(&storage), Arc::new(SyncLocks::new()), config, 2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let (device, user, folder) = (
            DeviceId::new("dev123"),
            UserId::new("mike"),
            CollectionId::new("INBOX"),
        );
        let series = keys[0].series().unwrap();
        for (counter, present) in [(1, false), (2, false), (3, true), (4, true)] {
            let row = storage
                .load_state(&device, &user, &folder, series, counter)
                .await
                .unwrap();
            assert_eq!(row.is_some(), present, "counter {counter}");
        }

        // A retry of the previous round still works.
        assert!(machine(&storage).load_state(&keys[2]).await.is_ok());
    }

    #[tokio::test]
    async fn cleanup_task_disabled() {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let config = CleanupConfig {
            interval_secs: 1,
            enabled: false,
        };

        let handle = spawn_cleanup_task(storage, Arc::new(SyncLocks::new()), config, 2);

        // Task should complete immediately when disabled
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("Task should complete when disabled")
            .expect("Task should not panic");
    }
}
