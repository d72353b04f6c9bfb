//! Storage layer for sync-state.
//!
//! Persists sync caches, per-collection sync-key rows, the PIM change map and
//! device records.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use eas_sync_types::{ChangeType, CollectionClass, CollectionId, DeviceId, RwStatus, UserId};

/// A stored sync cache blob.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    /// Serialized cache data.
    pub data: Vec<u8>,
    /// Incremented on every successful write.
    pub version: i64,
    /// Unix milliseconds of the last write.
    pub updated_at: i64,
}

/// One sync key of one collection.
#[derive(Debug, Clone)]
pub struct StateRow {
    /// Device the state belongs to.
    pub device_id: DeviceId,
    /// User the state belongs to.
    pub user_id: UserId,
    /// Collection the state belongs to.
    pub folder_id: CollectionId,
    /// Key series identifier.
    pub series: String,
    /// Position of the key within its series.
    pub counter: u64,
    /// Serialized folder snapshot.
    pub data: Vec<u8>,
    /// Serialized changes not yet sent to the client.
    pub pending: Option<Vec<u8>>,
    /// Unix seconds of the save.
    pub sync_time: i64,
}

/// A client-originated change recorded with the key it was committed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRow {
    /// Item identifier on the server.
    pub message_id: String,
    /// Client-assigned identifier for additions.
    pub client_id: Option<String>,
    /// Kind of change.
    pub change_type: ChangeType,
    /// Server revision after the change, when known.
    pub revision: Option<u64>,
    /// Unix seconds when the change was imported.
    pub timestamp: i64,
}

/// Atomic write of a new sync key together with the change map.
#[derive(Debug, Clone)]
pub struct StateCommit {
    /// The new key's row.
    pub row: StateRow,
    /// Highest counter of the series seen when the state was loaded.
    pub expected_latest: Option<u64>,
    /// Changes imported from the client this round.
    pub map: Vec<MapRow>,
}

/// Outcome of [`StateStorage::commit_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Row and map written.
    Committed,
    /// Another request moved the series first; nothing written.
    Stale {
        /// Highest counter currently stored.
        latest: Option<u64>,
    },
}

/// A known device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Device identifier.
    pub device_id: DeviceId,
    /// User of the device.
    pub user_id: UserId,
    /// Device type reported by the client.
    pub device_type: String,
    /// User agent reported by the client.
    pub user_agent: String,
    /// Current provisioning policy key.
    pub policy_key: Option<u64>,
    /// Remote wipe status.
    pub rw_status: RwStatus,
    /// Item classes the device synchronizes.
    pub supported: Vec<CollectionClass>,
}

impl DeviceRecord {
    /// A freshly seen device with no policy.
    pub fn new(
        device_id: DeviceId,
        user_id: UserId,
        device_type: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            device_id,
            user_id,
            device_type: device_type.into(),
            user_agent: user_agent.into(),
            policy_key: None,
            rw_status: RwStatus::Na,
            supported: Vec::new(),
        }
    }
}

/// Trait for sync-state storage backends.
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Load the sync cache of a device and user.
    async fn load_cache(
        &self,
        device: &DeviceId,
        user: &UserId,
    ) -> Result<Option<CacheRecord>, StorageError>;

    /// Store a sync cache if its version still matches.
    ///
    /// `expected_version` is `None` when no copy was stored at load time.
    /// Returns the new version, or `None` when another writer got there first.
    async fn store_cache(
        &self,
        device: &DeviceId,
        user: &UserId,
        data: &[u8],
        expected_version: Option<i64>,
        updated_at: i64,
    ) -> Result<Option<i64>, StorageError>;

    /// Remove a sync cache.
    async fn delete_cache(&self, device: &DeviceId, user: &UserId) -> Result<(), StorageError>;

    /// Load the row for one key of a collection.
    async fn load_state(
        &self,
        device: &DeviceId,
        user: &UserId,
        folder: &CollectionId,
        series: &str,
        counter: u64,
    ) -> Result<Option<StateRow>, StorageError>;

    /// Highest counter stored for a series.
    async fn latest_counter(
        &self,
        device: &DeviceId,
        user: &UserId,
        folder: &CollectionId,
        series: &str,
    ) -> Result<Option<u64>, StorageError>;

    /// Write a key row and its change map in one transaction.
    ///
    /// Fails with [`CommitOutcome::Stale`] when the series' highest counter
    /// no longer equals `expected_latest`. An existing row with the same
    /// counter (a retried round) is replaced.
    async fn commit_state(&self, commit: StateCommit) -> Result<CommitOutcome, StorageError>;

    /// Client changes committed under one key.
    async fn load_map(
        &self,
        device: &DeviceId,
        user: &UserId,
        folder: &CollectionId,
        series: &str,
        counter: u64,
    ) -> Result<Vec<MapRow>, StorageError>;

    /// Server id of an addition previously imported with `client_id`.
    async fn find_client_id(
        &self,
        device: &DeviceId,
        user: &UserId,
        folder: &CollectionId,
        client_id: &str,
    ) -> Result<Option<String>, StorageError>;

    /// Forget every key and map row of a collection.
    async fn reset_collection(
        &self,
        device: &DeviceId,
        user: &UserId,
        folder: &CollectionId,
    ) -> Result<u64, StorageError>;

    /// Remove all state of a device, for one user or all users.
    async fn remove_device_state(
        &self,
        device: &DeviceId,
        user: Option<&UserId>,
    ) -> Result<(), StorageError>;

    /// Insert or update a device.
    async fn save_device(&self, device: &DeviceRecord) -> Result<(), StorageError>;

    /// Load a device.
    async fn load_device(
        &self,
        device: &DeviceId,
        user: &UserId,
    ) -> Result<Option<DeviceRecord>, StorageError>;

    /// Rotate the policy key of every user of a device.
    async fn set_policy_key(&self, device: &DeviceId, key: u64) -> Result<(), StorageError>;

    /// Change the remote wipe status of a device.
    ///
    /// `Pending` also clears the policy key so the device re-provisions.
    async fn set_rw_status(&self, device: &DeviceId, status: RwStatus)
        -> Result<(), StorageError>;

    /// List devices, optionally for one user.
    async fn list_devices(&self, user: Option<&UserId>) -> Result<Vec<DeviceRecord>, StorageError>;

    /// Drop key rows beyond the newest `keep` of each series, with their map
    /// rows. Returns the number of key rows removed.
    async fn gc_states(&self, keep: u32) -> Result<u64, StorageError>;
}
