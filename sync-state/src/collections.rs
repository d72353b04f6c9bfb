//! Collection working set of one protocol exchange.
//!
//! A [`Collections`] handler is created per request. It merges the
//! collections a client describes with what the [`SyncCache`] remembers,
//! decides whether a partial sync can proceed, guards against clients looping
//! on one sync key, and runs the heartbeat long-poll.
//!
//! ## Flow
//!
//! ```text
//! load_collections_from_cache ─► add_collection* ─► init_partial_sync
//!                                                        │
//!                          ┌──────── true ───────────────┤
//!                          ▼                             ▼ false
//!        get_missing_collections_from_cache        init_full_sync
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use eas_sync_core::{
    materially_differs, CollectionState, CollectionsPhase, FieldMask, PhaseEvent,
};
use eas_sync_types::{unix_now, CollectionId, FilterType, RwStatus, SyncError, SyncKey};

use crate::backend::{Driver, DriverError};
use crate::config::{Config, PingConfig, SyncConfig};
use crate::error::{Result, StateError};
use crate::state::StateMachine;
use crate::storage::StateStorage;
use crate::sync_cache::SyncCache;

/// Result of [`Collections::poll_for_changes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// These collections have something to send.
    Changes(Vec<CollectionId>),
    /// The heartbeat expired without changes.
    NoChanges,
    /// The request was cancelled.
    Cancelled,
    /// Another request replaced the sync cache.
    Stale,
    /// No collection is known; the client must issue a full sync.
    SyncRequired,
    /// The folder hierarchy must be synchronized first.
    FolderSyncRequired,
}

/// Per-request collection working set.
pub struct Collections<S: StateStorage> {
    cache: SyncCache<S>,
    sync: SyncConfig,
    ping: PingConfig,
    collections: BTreeMap<CollectionId, CollectionState>,
    phase: CollectionsPhase,
    /// Client-supplied collections that differ from the cache.
    dirty: BTreeSet<CollectionId>,
    client_supplied: BTreeSet<CollectionId>,
    heartbeat_changed: bool,
    imported_changes: bool,
    /// Window size of the whole request, applied to collections pulled
    /// from the cache.
    window_size: Option<u32>,
    synckey_count: usize,
    unchanged_count: usize,
    confirmed_count: usize,
}

fn resume_key(cached: &CollectionState) -> Option<SyncKey> {
    cached.last_sync_key.clone().or_else(|| cached.sync_key.clone())
}

impl<S: StateStorage> Collections<S> {
    /// Create an empty working set on top of a loaded cache.
    pub fn new(cache: SyncCache<S>, config: &Config) -> Self {
        Self {
            cache,
            sync: config.sync.clone(),
            ping: config.ping.clone(),
            collections: BTreeMap::new(),
            phase: CollectionsPhase::default(),
            dirty: BTreeSet::new(),
            client_supplied: BTreeSet::new(),
            heartbeat_changed: false,
            imported_changes: false,
            window_size: None,
            synckey_count: 0,
            unchanged_count: 0,
            confirmed_count: 0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> CollectionsPhase {
        self.phase
    }

    /// The underlying cache.
    pub fn cache(&self) -> &SyncCache<S> {
        &self.cache
    }

    /// Mutable access to the underlying cache.
    pub fn cache_mut(&mut self) -> &mut SyncCache<S> {
        &mut self.cache
    }

    /// Give the cache back, for example to save it after the exchange.
    pub fn into_cache(self) -> SyncCache<S> {
        self.cache
    }

    /// One collection of the working set.
    pub fn get(&self, id: &CollectionId) -> Option<&CollectionState> {
        self.collections.get(id)
    }

    /// Iterate the working set in collection order.
    pub fn iter(&self) -> impl Iterator<Item = &CollectionState> {
        self.collections.values()
    }

    /// Number of collections in the working set.
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Check whether a client-supplied collection differs from the cache.
    pub fn is_dirty(&self, id: &CollectionId) -> bool {
        self.dirty.contains(id)
    }

    fn transition(&mut self, event: PhaseEvent) {
        let next = self.phase.on_event(event);
        if next != self.phase {
            debug!(from = ?self.phase, to = ?next, "collections phase");
            self.phase = next;
        }
    }

    /// Populate the working set with every cached collection that completed
    /// a round, each resumed at its last confirmed key.
    ///
    /// Collections already in the working set are left alone.
    pub fn load_collections_from_cache(&mut self) {
        for (id, mut cached) in self.cache.get_collections(false) {
            if self.collections.contains_key(&id) {
                continue;
            }
            let Some(key) = resume_key(&cached) else {
                continue;
            };
            cached.sync_key = Some(key);
            self.collections.insert(id, cached);
        }
        debug!(
            device = %self.cache.device(),
            collections = self.collections.len(),
            "collections loaded from cache"
        );
        self.transition(PhaseEvent::CacheLoaded);
    }

    /// Merge a collection described by the client.
    ///
    /// The client's description replaces any working copy. It is marked
    /// dirty when it changes the filter, body preferences or sync key the
    /// cache knows.
    pub fn add_collection(&mut self, collection: CollectionState) {
        let cached = self.cache.get_collection(&collection.id).map(|c| CollectionState {
            sync_key: resume_key(c),
            ..c.clone()
        });
        let id = collection.id.clone();

        if materially_differs(&collection, cached.as_ref()) {
            debug!(collection = %id, "client collection differs from cache");
            self.dirty.insert(id.clone());
        } else {
            self.dirty.remove(&id);
        }
        self.client_supplied.insert(id.clone());
        self.collections.insert(id, collection);
        self.transition(PhaseEvent::ClientCollectionAdded);
    }

    /// Fill options the client omitted from the cache and clamp window sizes.
    pub fn validate_from_cache(&mut self) {
        let default_window = self.window_size.unwrap_or(self.sync.default_window_size);
        let max_window = self.sync.max_window_size;
        self.cache.data_mut().validate_collections_from_cache(
            self.collections.values_mut(),
            default_window,
            max_window,
        );
    }

    /// Window size sent for the request as a whole.
    pub fn set_window_size(&mut self, window_size: Option<u32>) {
        self.window_size = window_size.map(|w| w.min(self.sync.max_window_size));
    }

    /// Record the heartbeat the client asked for.
    ///
    /// `wait` is in minutes, `hbinterval` in seconds. A value different from
    /// the cached one counts as a change for partial sync.
    pub fn set_heartbeat(&mut self, wait: Option<u32>, hbinterval: Option<u32>) {
        let data = self.cache.data();
        if data.wait() == wait && data.hbinterval() == hbinterval {
            return;
        }
        debug!(?wait, ?hbinterval, "heartbeat changed");
        let data = self.cache.data_mut();
        data.set_wait(wait);
        data.set_hbinterval(hbinterval);
        self.heartbeat_changed = true;
    }

    /// Heartbeat in seconds, clamped to the configured range.
    ///
    /// `None` when the request is not a hanging sync.
    pub fn heartbeat(&self) -> Option<u64> {
        let data = self.cache.data();
        let requested = data
            .hbinterval()
            .map(u64::from)
            .or_else(|| data.wait().map(|minutes| u64::from(minutes) * 60))?;
        Some(self.ping.clamp_heartbeat(Some(requested)))
    }

    /// Check whether the client asked to wait for changes.
    pub fn is_hanging_sync(&self) -> bool {
        self.heartbeat().is_some()
    }

    /// Note whether client changes were imported this round.
    pub fn set_imported_changes(&mut self, imported: bool) {
        self.imported_changes = imported;
    }

    /// Whether client changes were imported this round.
    pub fn imported_changes(&self) -> bool {
        self.imported_changes
    }

    /// Decide whether the working set supports a partial sync.
    ///
    /// True when a collection with a confirmed key in the cache was changed
    /// by the client, or the heartbeat changed. A working set only loaded
    /// from the cache, or a cache with an unfinished heartbeat sync, requires
    /// a full sync.
    pub fn init_partial_sync(&mut self) -> bool {
        self.synckey_count = 0;
        self.unchanged_count = 0;
        self.confirmed_count = 0;

        let presented: Vec<(CollectionId, SyncKey)> = self
            .client_supplied
            .iter()
            .filter_map(|id| {
                let key = self.collections.get(id)?.sync_key.clone()?;
                Some((id.clone(), key))
            })
            .collect();
        for (id, key) in presented {
            self.synckey_count += 1;
            let cached = self.cache.get_collection(&id).and_then(resume_key);
            if cached.as_ref() == Some(&key) {
                self.unchanged_count += 1;
            }
            if self.cache.data_mut().remove_confirmed_key(&key) {
                self.confirmed_count += 1;
            }
        }

        let timestamps_ok = self.cache.data().validate_timestamps(unix_now());
        let ready = timestamps_ok
            && self.collections.keys().any(|id| {
                let confirmed = self
                    .cache
                    .get_collection(id)
                    .is_some_and(|c| c.last_sync_key.is_some());
                confirmed && (self.heartbeat_changed || self.dirty.contains(id))
            });

        info!(
            device = %self.cache.device(),
            ready,
            timestamps_ok,
            synckeys = self.synckey_count,
            unchanged = self.unchanged_count,
            confirmed = self.confirmed_count,
            "partial sync evaluated"
        );
        self.transition(PhaseEvent::PartialSyncEvaluated { ready });
        ready
    }

    /// Complete a partial request from the cache.
    ///
    /// Fields the client left out are taken from the cached copy, and cached
    /// collections the client did not mention are added. A collection with
    /// neither a key nor a cached copy cannot be synchronized partially.
    pub fn get_missing_collections_from_cache(&mut self) -> Result<()> {
        for collection in self.collections.values_mut() {
            match self.cache.get_collection(&collection.id) {
                Some(cached) => {
                    if collection.sync_key.is_none() {
                        collection.sync_key = resume_key(cached);
                    }
                    collection.fill_from(cached);
                }
                None if collection.sync_key.is_none() => {
                    return Err(SyncError::ProtocolViolation(format!(
                        "partial sync of unknown collection {}",
                        collection.id
                    ))
                    .into());
                }
                None => {}
            }
        }

        let mut added = 0;
        for (id, mut cached) in self.cache.get_collections(true) {
            if self.collections.contains_key(&id) {
                continue;
            }
            cached.sync_key = resume_key(&cached);
            if let Some(window) = self.window_size {
                cached.window_size = Some(window);
            }
            self.collections.insert(id, cached);
            added += 1;
        }
        debug!(added, total = self.collections.len(), "missing collections filled from cache");
        Ok(())
    }

    /// Check the filter type the client sent against the cached one.
    ///
    /// A changed filter invalidates the collection: it is dropped from the
    /// cache, which is saved, and `false` is returned so the client restarts
    /// the collection.
    pub async fn check_filter_type(
        &mut self,
        id: &CollectionId,
        filter: Option<FilterType>,
    ) -> Result<bool> {
        let cached = self.cache.get_collection(id).and_then(|c| c.filter_type);
        match (filter, cached) {
            (Some(sent), Some(known)) if sent != known => {
                info!(collection = %id, ?sent, ?known, "filter type changed, collection reset");
                self.cache.data_mut().remove_collection(id);
                self.cache.save().await?;
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// Whether a hanging sync may answer with an empty response.
    pub fn can_send_empty_response(&self) -> bool {
        !self.imported_changes && self.is_hanging_sync()
    }

    /// Whether a partial request only repeated keys the cache already has.
    ///
    /// Valid after [`init_partial_sync`](Self::init_partial_sync).
    pub fn have_no_changes_in_partial_sync(&self) -> bool {
        self.synckey_count > 0
            && self.confirmed_count == 0
            && self.unchanged_count == self.synckey_count
            && !self.is_hanging_sync()
    }

    /// Whether the request may wait for changes.
    pub fn can_do_looping_sync(&self) -> bool {
        self.is_hanging_sync() && !self.imported_changes
    }

    /// Check whether any collection can be synchronized, loading the cached
    /// ones when the client sent none.
    pub fn have_syncable_collections(&mut self) -> bool {
        if self.collections.is_empty() {
            self.load_collections_from_cache();
        }
        self.collections.values().any(|c| c.sync_key.is_some())
    }

    /// Whether a folder hierarchy was ever sent to the device.
    pub fn have_hierarchy(&self) -> bool {
        self.cache.data().hierarchy().is_some()
    }

    /// Detect loops on one sync key.
    ///
    /// A collection whose key was presented more than the configured number
    /// of times has its state removed and restarts from the initial key.
    /// Returns `false` when any collection was reset.
    pub async fn check_loop_counters(&mut self) -> Result<bool> {
        let max = self.sync.max_synckey_repeats;
        let mut unseen = Vec::new();
        let mut looping = Vec::new();

        for (id, collection) in &self.collections {
            let Some(key) = &collection.sync_key else {
                continue;
            };
            match self.cache.data().synckey_count(id, key) {
                0 => unseen.push((id.clone(), key.clone())),
                count if count > max => {
                    warn!(collection = %id, key = %key, count, "client is looping on a sync key");
                    looping.push(id.clone());
                }
                _ => {}
            }
        }

        for (id, key) in unseen {
            self.cache.data_mut().reset_synckey_counter(&id, &key);
        }
        for id in &looping {
            let mut state = self.state_machine(id);
            state.remove_state().await?;
            self.cache.data_mut().reset_synckey_counter(id, &SyncKey::Initial);
            if let Some(collection) = self.collections.get_mut(id) {
                collection.sync_key = Some(SyncKey::Initial);
            }
        }
        Ok(looping.is_empty())
    }

    /// Count one more presentation of each collection's key.
    pub fn increment_loop_counter(&mut self) {
        for (id, collection) in &self.collections {
            if let Some(key) = &collection.sync_key {
                self.cache.data_mut().increment_synckey_counter(id, key);
            }
        }
    }

    /// Mark a collection as needing server changes this round.
    pub fn set_get_changes_flag(&mut self, id: &CollectionId) -> Result<()> {
        let collection = self
            .collections
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound { id: id.to_string() })?;
        collection.get_changes = true;
        Ok(())
    }

    /// Whether server changes must be exported for a collection.
    pub fn get_changes_flag(&self, id: &CollectionId) -> bool {
        self.collections.get(id).is_some_and(|c| c.get_changes)
    }

    /// Record the key issued to the client at the end of a round.
    pub fn confirm_sync_key(&mut self, id: &CollectionId, key: SyncKey) {
        self.cache.data_mut().add_confirmed_key(&key);
        self.cache.data_mut().confirm_sync_key(id, key.clone());
        if let Some(collection) = self.collections.get_mut(id) {
            collection.sync_key = Some(key);
        }
    }

    /// Write the working set's options into the cache.
    ///
    /// Only fields set in each working copy overwrite the cached ones.
    pub fn update_cache(&mut self) {
        for collection in self.collections.values() {
            self.cache
                .update_collection(collection, &FieldMask::present(collection));
        }
    }

    /// Persist the cache.
    pub async fn save(&mut self) -> Result<()> {
        self.cache.save().await
    }

    /// Replace the working set with the stored cache's view.
    ///
    /// Collections no longer stored are dropped.
    pub async fn update_collections_from_cache(&mut self) -> Result<()> {
        self.cache.refresh_collections().await?;
        let cache = &self.cache;
        self.collections.retain(|id, collection| match cache.get_collection(id) {
            Some(cached) => {
                *collection = CollectionState {
                    sync_key: resume_key(cached),
                    ..cached.clone()
                };
                true
            }
            None => false,
        });
        Ok(())
    }

    /// Check whether another request replaced the cache since it was loaded.
    pub async fn check_stale_request(&self) -> Result<bool> {
        Ok(!self.cache.validate_cache().await?)
    }

    /// Start over with the client's full description of its collections.
    ///
    /// Forgets pending keys and every cached key, then stores the working
    /// set.
    pub fn init_full_sync(&mut self) {
        let data = self.cache.data_mut();
        data.clear_confirmed_keys();
        data.clear_collection_keys();
        for collection in self.collections.values() {
            self.cache.add_collection(collection);
        }
        info!(
            device = %self.cache.device(),
            collections = self.collections.len(),
            "full sync initialized"
        );
    }

    fn server_id(&self, id: &CollectionId) -> String {
        self.collections
            .get(id)
            .and_then(|c| c.server_id.clone())
            .or_else(|| self.cache.get_folder(id).map(|f| f.server_id.clone()))
            .unwrap_or_else(|| id.to_string())
    }

    fn state_machine(&self, id: &CollectionId) -> StateMachine<S> {
        StateMachine::new(
            std::sync::Arc::clone(self.cache.storage()),
            self.cache.device().clone(),
            self.cache.user().clone(),
            id.clone(),
            self.server_id(id),
        )
    }

    /// Wait until a collection has changes, the heartbeat expires or the
    /// request is cancelled.
    ///
    /// The backend is checked every `interval`. Collections found with
    /// changes get their get-changes flag set. Between checks the working
    /// set is refreshed from the stored cache so keys confirmed by other
    /// requests are honoured.
    pub async fn poll_for_changes<D: Driver + ?Sized>(
        &mut self,
        driver: &D,
        heartbeat: Duration,
        interval: Duration,
        pingable_only: bool,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<PollOutcome> {
        let device = self.cache.device().clone();
        let deadline = Instant::now() + heartbeat;

        self.cache.data_mut().set_last_hb_sync_started(Some(unix_now()));
        self.cache.save().await?;
        info!(device = %device, heartbeat_secs = heartbeat.as_secs(), "heartbeat sync started");

        let mut found = Vec::new();
        loop {
            if self.check_stale_request().await? {
                info!(device = %device, "heartbeat sync superseded");
                return Ok(PollOutcome::Stale);
            }
            if self.collections.is_empty() {
                return Ok(PollOutcome::SyncRequired);
            }
            let record = self
                .cache
                .storage()
                .load_device(&device, self.cache.user())
                .await?;
            if record.is_some_and(|d| matches!(d.rw_status, RwStatus::Pending | RwStatus::Wiped)) {
                info!(device = %device, "remote wipe requested, ending heartbeat sync");
                return Ok(PollOutcome::FolderSyncRequired);
            }

            let ids: Vec<CollectionId> = self.collections.keys().cloned().collect();
            for id in ids {
                if pingable_only && !self.cache.collection_is_pingable(&id) {
                    continue;
                }
                match self.collection_has_changes(driver, &id).await {
                    Ok(true) => found.push(id),
                    Ok(false) => {}
                    Err(StateError::Driver(DriverError::NotFound(folder))) => {
                        warn!(collection = %id, folder = %folder, "folder vanished during heartbeat sync");
                        return Ok(PollOutcome::FolderSyncRequired);
                    }
                    Err(e) => return Err(e),
                }
            }
            if !found.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let pause = interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        debug!(device = %device, "heartbeat sync cancelled");
                        return Ok(PollOutcome::Cancelled);
                    }
                }
            }
            self.update_collections_from_cache().await?;
        }

        if self.check_stale_request().await? {
            return Ok(PollOutcome::Stale);
        }
        self.end_heartbeat_sync().await?;
        if found.is_empty() {
            debug!(device = %device, "heartbeat expired without changes");
            return Ok(PollOutcome::NoChanges);
        }
        for id in &found {
            self.set_get_changes_flag(id)?;
        }
        info!(device = %device, collections = found.len(), "changes found during heartbeat sync");
        Ok(PollOutcome::Changes(found))
    }

    /// Mark the heartbeat sync as finished normally so later requests may
    /// sync partially.
    async fn end_heartbeat_sync(&mut self) -> Result<()> {
        self.cache.data_mut().set_last_sync_end_normal(Some(unix_now()));
        self.cache.save().await
    }

    async fn collection_has_changes<D: Driver + ?Sized>(
        &self,
        driver: &D,
        id: &CollectionId,
    ) -> Result<bool> {
        let key = match self.collections.get(id).and_then(|c| c.sync_key.clone()) {
            Some(key) if !key.is_initial() => key,
            _ => return Ok(true),
        };

        let mut state = self.state_machine(id);
        match state.load_state(&key).await {
            Ok(()) => {}
            Err(e) if e.requires_resync() => {
                debug!(collection = %id, error = %e, "sync state unusable, collection needs a sync");
                return Ok(true);
            }
            Err(e) => return Err(e),
        }
        Ok(state.change_count(driver).await? > 0)
    }
}
