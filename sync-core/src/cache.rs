//! Sync cache data model.
//!
//! [`CacheData`] is everything remembered about one (device, user) pair
//! between requests: the collections it syncs, the folder hierarchy it was
//! sent, heartbeat settings and bookkeeping timestamps.
//!
//! Every mutation is recorded in a change set. When the cache is saved and
//! another request has stored a newer copy in the meantime, only the recorded
//! changes are replayed onto that copy (see [`CacheData::merge_into`]), so
//! concurrent requests touching different collections do not lose each
//! other's updates.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use eas_sync_types::{
    CollectionClass, CollectionId, ConflictPolicy, FilterType, SyncError, SyncKey,
};

/// Body preference requested for one body type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPreference {
    /// Truncate bodies larger than this many bytes.
    pub truncation_size: Option<u32>,
    /// Send the whole body or nothing.
    pub all_or_none: Option<bool>,
    /// Preview length in characters.
    pub preview: Option<u32>,
}

/// Synchronization options and progress for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionState {
    /// Folder UID.
    pub id: CollectionId,
    /// Item class.
    pub class: Option<CollectionClass>,
    /// Backend folder identifier.
    pub server_id: Option<String>,
    /// Time window to synchronize.
    pub filter_type: Option<FilterType>,
    /// Plain-text truncation.
    pub truncation: Option<u32>,
    /// RTF truncation.
    pub rtf_truncation: Option<u32>,
    /// MIME support level.
    pub mime_support: Option<u8>,
    /// MIME truncation.
    pub mime_truncation: Option<u32>,
    /// Body preferences keyed by body type.
    pub body_prefs: Option<BTreeMap<u8, BodyPreference>>,
    /// Maximum number of changes per response.
    pub window_size: Option<u32>,
    /// Client wants deletions turned into moves to the trash.
    pub deletes_as_moves: Option<bool>,
    /// Requested conflict resolution.
    pub conflict: Option<ConflictPolicy>,
    /// Key presented (or to be presented) by the client.
    pub sync_key: Option<SyncKey>,
    /// Last key confirmed by a completed round.
    pub last_sync_key: Option<SyncKey>,
    /// Included in ping / heartbeat monitoring.
    pub pingable: Option<bool>,

    /// Server changes must be exported this round.
    #[serde(skip)]
    pub get_changes: bool,
    /// Client id to server id for items added this round.
    #[serde(skip)]
    pub client_ids: BTreeMap<String, String>,
    /// Items the client asked to fetch.
    #[serde(skip)]
    pub fetch_ids: Vec<String>,
}

impl CollectionState {
    /// Create an empty state for a collection.
    pub fn new(id: impl Into<CollectionId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Compare the options a client can change, ignoring per-request data.
    pub fn same_options(&self, other: &CollectionState) -> bool {
        self.class == other.class
            && self.filter_type == other.filter_type
            && self.truncation == other.truncation
            && self.rtf_truncation == other.rtf_truncation
            && self.mime_support == other.mime_support
            && self.mime_truncation == other.mime_truncation
            && self.body_prefs == other.body_prefs
            && self.window_size == other.window_size
            && self.deletes_as_moves == other.deletes_as_moves
            && self.conflict == other.conflict
            && self.sync_key == other.sync_key
    }

    /// Fill every field this state leaves unset from `cached`.
    pub fn fill_from(&mut self, cached: &CollectionState) {
        let have = FieldMask::present(self);
        let missing = FieldMask::of(
            FieldMask::present(cached)
                .0
                .into_iter()
                .filter(|field| !have.contains(*field)),
        );
        missing.apply(self, cached);
    }
}

/// A field of [`CollectionState`] that can be selectively updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CollectionField {
    /// [`CollectionState::class`]
    Class,
    /// [`CollectionState::server_id`]
    ServerId,
    /// [`CollectionState::filter_type`]
    FilterType,
    /// [`CollectionState::truncation`]
    Truncation,
    /// [`CollectionState::rtf_truncation`]
    RtfTruncation,
    /// [`CollectionState::mime_support`]
    MimeSupport,
    /// [`CollectionState::mime_truncation`]
    MimeTruncation,
    /// [`CollectionState::body_prefs`]
    BodyPrefs,
    /// [`CollectionState::window_size`]
    WindowSize,
    /// [`CollectionState::deletes_as_moves`]
    DeletesAsMoves,
    /// [`CollectionState::conflict`]
    Conflict,
    /// [`CollectionState::sync_key`]
    SyncKey,
    /// [`CollectionState::last_sync_key`]
    LastSyncKey,
    /// [`CollectionState::pingable`]
    Pingable,
}

/// Selects which fields an update may overwrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMask(BTreeSet<CollectionField>);

impl FieldMask {
    /// Mask with no fields.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Mask with the given fields.
    pub fn of(fields: impl IntoIterator<Item = CollectionField>) -> Self {
        Self(fields.into_iter().collect())
    }

    /// Mask of every field set (`Some`) in `state`.
    pub fn present(state: &CollectionState) -> Self {
        use CollectionField::*;
        let mut mask = Self::empty();
        let checks = [
            (Class, state.class.is_some()),
            (ServerId, state.server_id.is_some()),
            (FilterType, state.filter_type.is_some()),
            (Truncation, state.truncation.is_some()),
            (RtfTruncation, state.rtf_truncation.is_some()),
            (MimeSupport, state.mime_support.is_some()),
            (MimeTruncation, state.mime_truncation.is_some()),
            (BodyPrefs, state.body_prefs.is_some()),
            (WindowSize, state.window_size.is_some()),
            (DeletesAsMoves, state.deletes_as_moves.is_some()),
            (Conflict, state.conflict.is_some()),
            (SyncKey, state.sync_key.is_some()),
            (LastSyncKey, state.last_sync_key.is_some()),
            (Pingable, state.pingable.is_some()),
        ];
        for (field, set) in checks {
            if set {
                mask.0.insert(field);
            }
        }
        mask
    }

    /// Add a field.
    pub fn with(mut self, field: CollectionField) -> Self {
        self.0.insert(field);
        self
    }

    /// Check whether a field is selected.
    pub fn contains(&self, field: CollectionField) -> bool {
        self.0.contains(&field)
    }

    /// Copy the selected fields from `src` into `dst`.
    fn apply(&self, dst: &mut CollectionState, src: &CollectionState) {
        for field in &self.0 {
            match field {
                CollectionField::Class => dst.class = src.class,
                CollectionField::ServerId => dst.server_id = src.server_id.clone(),
                CollectionField::FilterType => dst.filter_type = src.filter_type,
                CollectionField::Truncation => dst.truncation = src.truncation,
                CollectionField::RtfTruncation => dst.rtf_truncation = src.rtf_truncation,
                CollectionField::MimeSupport => dst.mime_support = src.mime_support,
                CollectionField::MimeTruncation => dst.mime_truncation = src.mime_truncation,
                CollectionField::BodyPrefs => dst.body_prefs = src.body_prefs.clone(),
                CollectionField::WindowSize => dst.window_size = src.window_size,
                CollectionField::DeletesAsMoves => dst.deletes_as_moves = src.deletes_as_moves,
                CollectionField::Conflict => dst.conflict = src.conflict,
                CollectionField::SyncKey => dst.sync_key = src.sync_key.clone(),
                CollectionField::LastSyncKey => dst.last_sync_key = src.last_sync_key.clone(),
                CollectionField::Pingable => dst.pingable = src.pingable,
            }
        }
    }
}

/// A folder from the hierarchy sent to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInfo {
    /// Item class derived from the folder type.
    pub class: CollectionClass,
    /// Backend folder identifier.
    pub server_id: String,
    /// Parent folder UID.
    pub parent_id: Option<CollectionId>,
    /// Display name.
    pub display_name: String,
    /// Protocol folder type number.
    pub folder_type: u8,
}

impl FolderInfo {
    /// Build a folder entry, deriving the class from the folder type.
    pub fn new(
        server_id: impl Into<String>,
        parent_id: Option<CollectionId>,
        display_name: impl Into<String>,
        folder_type: u8,
    ) -> Self {
        Self {
            class: CollectionClass::from_folder_type(folder_type),
            server_id: server_id.into(),
            parent_id,
            display_name: display_name.into(),
            folder_type,
        }
    }
}

/// How many times a sync key has been presented for a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncKeyCounter {
    /// The key being counted.
    pub key: String,
    /// Number of times it was presented.
    pub count: u32,
}

/// Cache-level fields tracked for merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum ScalarField {
    HbInterval,
    Wait,
    Hierarchy,
    ConfirmedKeys,
    LastUntil,
    LastHbSyncStarted,
    LastSyncEndNormal,
    SyncKeyCounters,
}

/// Mutations recorded since the cache was loaded or last saved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CacheChanges {
    collections: BTreeSet<CollectionId>,
    folders: BTreeSet<CollectionId>,
    collections_replaced: bool,
    folders_replaced: bool,
    scalars: BTreeSet<ScalarField>,
}

impl CacheChanges {
    fn is_empty(&self) -> bool {
        self.collections.is_empty()
            && self.folders.is_empty()
            && !self.collections_replaced
            && !self.folders_replaced
            && self.scalars.is_empty()
    }
}

/// Persisted state for one (device, user) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheData {
    collections: BTreeMap<CollectionId, CollectionState>,
    folders: BTreeMap<CollectionId, FolderInfo>,
    hbinterval: Option<u32>,
    wait: Option<u32>,
    hierarchy: Option<String>,
    confirmed_synckeys: BTreeSet<String>,
    last_until: Option<i64>,
    last_hb_sync_started: Option<i64>,
    last_sync_end_normal: Option<i64>,
    synckey_counters: BTreeMap<CollectionId, SyncKeyCounter>,
    /// Unix milliseconds of the save that produced this copy.
    timestamp: i64,

    #[serde(skip)]
    changes: CacheChanges,
}

impl CacheData {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// Unix milliseconds of the save that produced this copy.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Set the save timestamp.
    pub fn set_timestamp(&mut self, millis: i64) {
        self.timestamp = millis;
    }

    /// Check whether anything was modified since load or last save.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Forget recorded modifications (after a successful save).
    pub fn clear_changes(&mut self) {
        self.changes = CacheChanges::default();
    }

    /// Replay this copy's recorded modifications onto a newer stored copy.
    ///
    /// Collections and folders are merged per entry; cache-level fields are
    /// merged per field. Entries this copy never touched keep the stored
    /// value. The returned copy carries this copy's change set, so a retry
    /// after another lost race merges the same modifications again.
    pub fn merge_into(&self, mut stored: CacheData) -> CacheData {
        let changes = &self.changes;

        if changes.collections_replaced {
            stored.collections = self.collections.clone();
        }
        for id in &changes.collections {
            match self.collections.get(id) {
                Some(c) => {
                    stored.collections.insert(id.clone(), c.clone());
                }
                None => {
                    stored.collections.remove(id);
                }
            }
        }

        if changes.folders_replaced {
            stored.folders = self.folders.clone();
        }
        for id in &changes.folders {
            match self.folders.get(id) {
                Some(f) => {
                    stored.folders.insert(id.clone(), f.clone());
                }
                None => {
                    stored.folders.remove(id);
                }
            }
        }

        for field in &changes.scalars {
            match field {
                ScalarField::HbInterval => stored.hbinterval = self.hbinterval,
                ScalarField::Wait => stored.wait = self.wait,
                ScalarField::Hierarchy => stored.hierarchy = self.hierarchy.clone(),
                ScalarField::ConfirmedKeys => {
                    stored.confirmed_synckeys = self.confirmed_synckeys.clone()
                }
                ScalarField::LastUntil => stored.last_until = self.last_until,
                ScalarField::LastHbSyncStarted => {
                    stored.last_hb_sync_started = self.last_hb_sync_started
                }
                ScalarField::LastSyncEndNormal => {
                    stored.last_sync_end_normal = self.last_sync_end_normal
                }
                ScalarField::SyncKeyCounters => {
                    stored.synckey_counters = self.synckey_counters.clone()
                }
            }
        }

        stored.changes = self.changes.clone();
        stored
    }

    fn touch_collection(&mut self, id: &CollectionId) {
        self.changes.collections.insert(id.clone());
    }

    fn touch(&mut self, field: ScalarField) {
        self.changes.scalars.insert(field);
    }

    // ---- collections ----

    /// Collections, optionally only those that completed a sync round.
    ///
    /// With `only_with_key`, collections without a `last_sync_key` (never
    /// synced) are left out.
    pub fn get_collections(&self, only_with_key: bool) -> BTreeMap<CollectionId, CollectionState> {
        self.collections
            .iter()
            .filter(|(_, c)| !only_with_key || c.last_sync_key.is_some())
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect()
    }

    /// Borrow one collection.
    pub fn get_collection(&self, id: &CollectionId) -> Option<&CollectionState> {
        self.collections.get(id)
    }

    /// Number of cached collections.
    pub fn count_collections(&self) -> usize {
        self.collections.len()
    }

    /// Check whether a collection is cached.
    pub fn collection_exists(&self, id: &CollectionId) -> bool {
        self.collections.contains_key(id)
    }

    /// Insert or replace a collection's options.
    ///
    /// Sync progress (`sync_key`, `last_sync_key`, `pingable`) of an existing
    /// entry is kept unless the new data carries it.
    pub fn add_collection(&mut self, data: &CollectionState) {
        let entry = self
            .collections
            .entry(data.id.clone())
            .or_insert_with(|| CollectionState::new(data.id.clone()));

        let keep_sync_key = entry.sync_key.clone();
        let keep_last = entry.last_sync_key.clone();
        let keep_pingable = entry.pingable;

        *entry = CollectionState {
            get_changes: false,
            client_ids: BTreeMap::new(),
            fetch_ids: Vec::new(),
            ..data.clone()
        };
        if entry.sync_key.is_none() {
            entry.sync_key = keep_sync_key;
        }
        if entry.last_sync_key.is_none() {
            entry.last_sync_key = keep_last;
        }
        if entry.pingable.is_none() {
            entry.pingable = keep_pingable;
        }

        let id = data.id.clone();
        self.touch_collection(&id);
    }

    /// Overwrite only the fields selected by `mask`, creating the entry if
    /// needed.
    pub fn update_collection(&mut self, data: &CollectionState, mask: &FieldMask) {
        let entry = self
            .collections
            .entry(data.id.clone())
            .or_insert_with(|| CollectionState::new(data.id.clone()));
        mask.apply(entry, data);

        let id = data.id.clone();
        self.touch_collection(&id);
    }

    /// Record a completed round: the key becomes both current and last.
    pub fn confirm_sync_key(&mut self, id: &CollectionId, key: SyncKey) {
        let entry = self
            .collections
            .entry(id.clone())
            .or_insert_with(|| CollectionState::new(id.clone()));
        entry.sync_key = Some(key.clone());
        entry.last_sync_key = Some(key);
        self.touch_collection(id);
    }

    /// Remove a collection.
    pub fn remove_collection(&mut self, id: &CollectionId) -> Option<CollectionState> {
        let removed = self.collections.remove(id);
        self.touch_collection(id);
        removed
    }

    /// Remove every collection.
    pub fn clear_collections(&mut self) {
        self.collections.clear();
        self.changes.collections_replaced = true;
    }

    /// Forget every collection's current sync key (full resync).
    pub fn clear_collection_keys(&mut self) {
        let ids: Vec<_> = self.collections.keys().cloned().collect();
        for id in ids {
            if let Some(c) = self.collections.get_mut(&id) {
                c.sync_key = None;
            }
            self.touch_collection(&id);
        }
    }

    /// Change a collection's window size.
    pub fn update_window_size(&mut self, id: &CollectionId, window_size: u32) {
        if let Some(c) = self.collections.get_mut(id) {
            c.window_size = Some(window_size);
            self.touch_collection(id);
        }
    }

    /// Include a collection in ping monitoring.
    pub fn set_pingable_collection(&mut self, id: &CollectionId) -> Result<(), SyncError> {
        self.set_pingable(id, true)
    }

    /// Exclude a collection from ping monitoring.
    pub fn remove_pingable_collection(&mut self, id: &CollectionId) -> Result<(), SyncError> {
        self.set_pingable(id, false)
    }

    fn set_pingable(&mut self, id: &CollectionId, pingable: bool) -> Result<(), SyncError> {
        let c = self
            .collections
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound { id: id.to_string() })?;
        c.pingable = Some(pingable);
        self.touch_collection(id);
        Ok(())
    }

    /// Check whether a collection is monitored by ping.
    pub fn collection_is_pingable(&self, id: &CollectionId) -> bool {
        self.collections
            .get(id)
            .and_then(|c| c.pingable)
            .unwrap_or(false)
    }

    /// Reload collections from a stored copy, keeping only those that
    /// completed a round and resuming them at their last confirmed key.
    pub fn refresh_collections(&mut self, stored: &CacheData) {
        self.collections = stored
            .collections
            .iter()
            .filter_map(|(id, c)| {
                let last = c.last_sync_key.clone()?;
                let mut c = c.clone();
                c.sync_key = Some(last);
                Some((id.clone(), c))
            })
            .collect();
        self.timestamp = stored.timestamp;
    }

    /// Fill options a client omitted from what the cache knows.
    ///
    /// Also clamps the window size to `max_window` (0 or oversized means
    /// max) and drops a cached key when the client restarts at `0`.
    pub fn validate_collections_from_cache<'a>(
        &mut self,
        collections: impl IntoIterator<Item = &'a mut CollectionState>,
        default_window: u32,
        max_window: u32,
    ) {
        for c in collections {
            let cached = self.collections.get(&c.id);

            if c.class.is_none() {
                c.class = self.folders.get(&c.id).map(|f| f.class);
            }
            if c.filter_type.is_none() {
                c.filter_type = cached.and_then(|x| x.filter_type);
            }
            if c.mime_support.is_none() {
                c.mime_support = cached.and_then(|x| x.mime_support);
            }
            if c.body_prefs.is_none() {
                c.body_prefs = cached.and_then(|x| x.body_prefs.clone());
            }
            if c.window_size.is_none() {
                c.window_size = Some(cached.and_then(|x| x.window_size).unwrap_or(default_window));
            }
            if matches!(c.window_size, Some(w) if w == 0 || w > max_window) {
                c.window_size = Some(max_window);
            }

            let restart = matches!(c.sync_key, Some(SyncKey::Initial))
                && matches!(cached.and_then(|x| x.sync_key.as_ref()), Some(k) if !k.is_initial());
            if restart {
                let id = c.id.clone();
                if let Some(entry) = self.collections.get_mut(&id) {
                    entry.sync_key = None;
                }
                self.touch_collection(&id);
            }
        }
    }

    // ---- folders ----

    /// The folder hierarchy sent to the device.
    pub fn get_folders(&self) -> &BTreeMap<CollectionId, FolderInfo> {
        &self.folders
    }

    /// One folder.
    pub fn get_folder(&self, id: &CollectionId) -> Option<&FolderInfo> {
        self.folders.get(id)
    }

    /// Insert or replace a folder.
    pub fn update_folder(&mut self, id: CollectionId, folder: FolderInfo) {
        self.changes.folders.insert(id.clone());
        self.folders.insert(id, folder);
    }

    /// Remove a folder and its collection.
    pub fn delete_folder(&mut self, id: &CollectionId) {
        self.folders.remove(id);
        self.changes.folders.insert(id.clone());
        self.collections.remove(id);
        self.touch_collection(id);
    }

    /// Remove every folder.
    pub fn clear_folders(&mut self) {
        self.folders.clear();
        self.changes.folders_replaced = true;
    }

    // ---- heartbeat and bookkeeping ----

    /// Heartbeat interval in seconds.
    pub fn hbinterval(&self) -> Option<u32> {
        self.hbinterval
    }

    /// Set the heartbeat interval.
    pub fn set_hbinterval(&mut self, secs: Option<u32>) {
        self.hbinterval = secs;
        self.touch(ScalarField::HbInterval);
    }

    /// Wait interval in minutes.
    pub fn wait(&self) -> Option<u32> {
        self.wait
    }

    /// Set the wait interval.
    pub fn set_wait(&mut self, minutes: Option<u32>) {
        self.wait = minutes;
        self.touch(ScalarField::Wait);
    }

    /// Folder hierarchy key last sent to the device.
    pub fn hierarchy(&self) -> Option<&str> {
        self.hierarchy.as_deref()
    }

    /// Set the folder hierarchy key.
    pub fn set_hierarchy(&mut self, key: Option<String>) {
        self.hierarchy = key;
        self.touch(ScalarField::Hierarchy);
    }

    /// Until when a finished long-poll asked the device to stay quiet.
    pub fn last_until(&self) -> Option<i64> {
        self.last_until
    }

    /// Set the quiet-until timestamp.
    pub fn set_last_until(&mut self, ts: Option<i64>) {
        self.last_until = ts;
        self.touch(ScalarField::LastUntil);
    }

    /// Start of the last heartbeat sync.
    pub fn last_hb_sync_started(&self) -> Option<i64> {
        self.last_hb_sync_started
    }

    /// Set the start of the current heartbeat sync.
    pub fn set_last_hb_sync_started(&mut self, ts: Option<i64>) {
        self.last_hb_sync_started = ts;
        self.touch(ScalarField::LastHbSyncStarted);
    }

    /// End of the last sync that finished normally.
    pub fn last_sync_end_normal(&self) -> Option<i64> {
        self.last_sync_end_normal
    }

    /// Set the end of the last normally finished sync.
    pub fn set_last_sync_end_normal(&mut self, ts: Option<i64>) {
        self.last_sync_end_normal = ts;
        self.touch(ScalarField::LastSyncEndNormal);
    }

    /// Check that no heartbeat sync is still marked as running and no quiet
    /// period is in effect.
    pub fn validate_timestamps(&self, now: i64) -> bool {
        if let Some(started) = self.last_hb_sync_started {
            match self.last_sync_end_normal {
                None => return false,
                Some(ended) if started > ended => return false,
                Some(_) => {}
            }
        }
        if let Some(until) = self.last_until {
            if now < until {
                return false;
            }
        }
        true
    }

    /// Sync keys sent to the client but not yet confirmed.
    pub fn confirmed_synckeys(&self) -> &BTreeSet<String> {
        &self.confirmed_synckeys
    }

    /// Remember a key sent to the client.
    pub fn add_confirmed_key(&mut self, key: &SyncKey) {
        self.confirmed_synckeys.insert(key.to_string());
        self.touch(ScalarField::ConfirmedKeys);
    }

    /// Forget a key; returns whether it was present.
    pub fn remove_confirmed_key(&mut self, key: &SyncKey) -> bool {
        let removed = self.confirmed_synckeys.remove(&key.to_string());
        if removed {
            self.touch(ScalarField::ConfirmedKeys);
        }
        removed
    }

    /// Forget every pending key.
    pub fn clear_confirmed_keys(&mut self) {
        self.confirmed_synckeys.clear();
        self.touch(ScalarField::ConfirmedKeys);
    }

    /// How often `key` was presented for a collection.
    pub fn synckey_count(&self, id: &CollectionId, key: &SyncKey) -> u32 {
        match self.synckey_counters.get(id) {
            Some(counter) if counter.key == key.to_string() => counter.count,
            _ => 0,
        }
    }

    /// Start counting `key` for a collection, dropping older keys' counts.
    pub fn reset_synckey_counter(&mut self, id: &CollectionId, key: &SyncKey) {
        self.synckey_counters.insert(
            id.clone(),
            SyncKeyCounter {
                key: key.to_string(),
                count: 0,
            },
        );
        self.touch(ScalarField::SyncKeyCounters);
    }

    /// Count one more presentation of `key`; returns the new count.
    pub fn increment_synckey_counter(&mut self, id: &CollectionId, key: &SyncKey) -> u32 {
        let key = key.to_string();
        let counter = self
            .synckey_counters
            .entry(id.clone())
            .or_insert_with(|| SyncKeyCounter {
                key: key.clone(),
                count: 0,
            });
        if counter.key != key {
            counter.key = key;
            counter.count = 0;
        }
        counter.count += 1;
        let count = counter.count;
        self.touch(ScalarField::SyncKeyCounters);
        count
    }
}
