//! Persisted sync cache for one (device, user) pair.
//!
//! [`SyncCache`] wraps the pure [`CacheData`] model with loading, staleness
//! checks and an optimistic save. Saves are compare-and-swap on a stored
//! version; when another request saved first, the stored copy is reloaded
//! and only this request's recorded modifications are replayed onto it.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use eas_sync_core::{CacheData, CollectionState, FieldMask, FolderInfo};
use eas_sync_types::{unix_now_millis, CollectionId, DeviceId, SyncError, UserId};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::storage::{CacheRecord, StateStorage};

/// Save attempts before giving up with [`SyncError::StaleCache`].
const SAVE_ATTEMPTS: usize = 3;

/// The sync cache of one device and user.
pub struct SyncCache<S: StateStorage> {
    storage: Arc<S>,
    device: DeviceId,
    user: UserId,
    data: CacheData,
    /// Stored version this copy is based on.
    version: Option<i64>,
    /// Unix milliseconds when this copy was loaded.
    loaded_at: i64,
    max_age_secs: u64,
}

fn decode(device: &DeviceId, user: &UserId, record: &CacheRecord) -> CacheData {
    match CacheData::from_bytes(&record.data) {
        Ok(data) => data,
        Err(e) => {
            warn!(device = %device, user = %user, error = %e, "discarding unreadable sync cache");
            CacheData::new()
        }
    }
}

impl<S: StateStorage> SyncCache<S> {
    /// Load the cache of a device and user.
    ///
    /// A missing or unreadable stored copy yields an empty cache, so first
    /// contact ends in a full resync instead of an error. Only an unreachable
    /// store fails.
    pub async fn load(
        storage: Arc<S>,
        device: DeviceId,
        user: UserId,
        config: &CacheConfig,
    ) -> Result<Self> {
        let record = storage.load_cache(&device, &user).await?;
        let (data, version) = match record {
            Some(record) => (decode(&device, &user, &record), Some(record.version)),
            None => {
                debug!(device = %device, user = %user, "no stored sync cache");
                (CacheData::new(), None)
            }
        };

        Ok(Self {
            storage,
            device,
            user,
            data,
            version,
            loaded_at: unix_now_millis(),
            max_age_secs: config.max_age_secs,
        })
    }

    /// Device this cache belongs to.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// User this cache belongs to.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Storage the cache persists to.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Borrow the cached data.
    pub fn data(&self) -> &CacheData {
        &self.data
    }

    /// Mutably borrow the cached data.
    pub fn data_mut(&mut self) -> &mut CacheData {
        &mut self.data
    }

    /// Stored version this copy is based on.
    pub fn version(&self) -> Option<i64> {
        self.version
    }

    /// Collections, optionally only those that completed a round.
    pub fn get_collections(&self, only_with_key: bool) -> BTreeMap<CollectionId, CollectionState> {
        self.data.get_collections(only_with_key)
    }

    /// One collection.
    pub fn get_collection(&self, id: &CollectionId) -> Option<&CollectionState> {
        self.data.get_collection(id)
    }

    /// Insert or replace a collection.
    pub fn add_collection(&mut self, data: &CollectionState) {
        self.data.add_collection(data);
    }

    /// Overwrite the masked fields of a collection.
    pub fn update_collection(&mut self, data: &CollectionState, mask: &FieldMask) {
        self.data.update_collection(data, mask);
    }

    /// Check whether a collection is cached.
    pub fn collection_exists(&self, id: &CollectionId) -> bool {
        self.data.collection_exists(id)
    }

    /// Check whether a collection is monitored by ping.
    pub fn collection_is_pingable(&self, id: &CollectionId) -> bool {
        self.data.collection_is_pingable(id)
    }

    /// Include a collection in ping monitoring.
    pub fn set_pingable_collection(&mut self, id: &CollectionId) -> Result<()> {
        Ok(self.data.set_pingable_collection(id)?)
    }

    /// Exclude a collection from ping monitoring.
    pub fn remove_pingable_collection(&mut self, id: &CollectionId) -> Result<()> {
        Ok(self.data.remove_pingable_collection(id)?)
    }

    /// The folder hierarchy.
    pub fn get_folders(&self) -> &BTreeMap<CollectionId, FolderInfo> {
        self.data.get_folders()
    }

    /// One folder.
    pub fn get_folder(&self, id: &CollectionId) -> Option<&FolderInfo> {
        self.data.get_folder(id)
    }

    /// Insert or replace a folder.
    pub fn update_folder(&mut self, id: CollectionId, folder: FolderInfo) {
        self.data.update_folder(id, folder);
    }

    /// Check that this copy is still current.
    ///
    /// Fails when another request stored a newer copy since this one was
    /// loaded, or when the copy is older than the configured maximum age.
    pub async fn validate_cache(&self) -> Result<bool> {
        if self.max_age_secs > 0 {
            let age_ms = unix_now_millis().saturating_sub(self.loaded_at);
            if age_ms > (self.max_age_secs as i64).saturating_mul(1000) {
                debug!(device = %self.device, age_ms, "sync cache exceeded maximum age");
                return Ok(false);
            }
        }

        let stored = self.storage.load_cache(&self.device, &self.user).await?;
        let current = stored.map(|record| record.version) == self.version;
        if !current {
            debug!(device = %self.device, user = %self.user, "sync cache superseded by another request");
        }
        Ok(current)
    }

    /// Reload collections from the stored copy.
    ///
    /// Only collections that completed a round are kept, each resumed at its
    /// last confirmed key. Other cached fields are left as they are.
    pub async fn refresh_collections(&mut self) -> Result<()> {
        let stored = match self.storage.load_cache(&self.device, &self.user).await? {
            Some(record) => decode(&self.device, &self.user, &record),
            None => CacheData::new(),
        };
        debug!(
            device = %self.device,
            collections = stored.count_collections(),
            "refreshing collections from stored sync cache"
        );
        self.data.refresh_collections(&stored);
        Ok(())
    }

    /// Persist the cache.
    ///
    /// When another request saved in the meantime, this copy's recorded
    /// modifications are merged onto the newer stored copy and the write is
    /// retried, so updates to different collections are never lost.
    pub async fn save(&mut self) -> Result<()> {
        let now = unix_now_millis();

        for attempt in 0..SAVE_ATTEMPTS {
            self.data.set_timestamp(now);
            let bytes = self.data.to_bytes()?;

            let stored = self
                .storage
                .store_cache(&self.device, &self.user, &bytes, self.version, now)
                .await?;
            if let Some(version) = stored {
                self.version = Some(version);
                self.data.clear_changes();
                debug!(device = %self.device, user = %self.user, version, "sync cache saved");
                return Ok(());
            }

            debug!(
                device = %self.device,
                user = %self.user,
                attempt,
                "sync cache changed concurrently, merging"
            );
            let (newer, version) = match self.storage.load_cache(&self.device, &self.user).await? {
                Some(record) => (decode(&self.device, &self.user, &record), Some(record.version)),
                None => (CacheData::new(), None),
            };
            self.data = self.data.merge_into(newer);
            self.version = version;
        }

        warn!(device = %self.device, user = %self.user, "giving up on sync cache save");
        Err(SyncError::StaleCache.into())
    }

    /// Remove the stored cache and start over empty.
    pub async fn delete(&mut self) -> Result<()> {
        self.storage.delete_cache(&self.device, &self.user).await?;
        self.data = CacheData::new();
        self.version = None;
        Ok(())
    }
}
