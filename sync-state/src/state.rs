//! Per-collection sync state.
//!
//! A [`StateMachine`] follows one collection of one device through a sync
//! round:
//!
//! 1. [`load_state`](StateMachine::load_state) at the key the client
//!    presented, establishing the snapshot the client last saw
//! 2. Client changes are checked with [`is_conflict`](StateMachine::is_conflict)
//!    and recorded with [`update_state`](StateMachine::update_state)
//! 3. Server changes are computed by [`get_changes`](StateMachine::get_changes)
//! 4. [`save`](StateMachine::save) commits the next key together with the
//!    change map in one transaction
//!
//! The commit is conditional on the series' highest key not having moved
//! since load. A request that loses that race gets
//! [`SyncError::StaleState`] and the client is sent back to key `0`.

use std::sync::Arc;
use tracing::{debug, info, warn};

use eas_sync_core::{is_conflict, Stamp};
use eas_sync_types::{
    unix_now, ChangeOrigin, ChangePayload, ChangeRecord, ChangeType, CollectionId, DeviceId,
    MessageStat, SyncError, SyncKey, UserId,
};

use crate::backend::Driver;
use crate::error::Result;
use crate::storage::{CommitOutcome, MapRow, StateCommit, StateRow, StateStorage};

/// Sync state of one collection for one device and user.
pub struct StateMachine<S: StateStorage> {
    storage: Arc<S>,
    device: DeviceId,
    user: UserId,
    collection: CollectionId,
    server_id: String,

    current: SyncKey,
    proposed: SyncKey,
    new_key: Option<SyncKey>,
    latest_at_load: Option<u64>,

    /// What the client has seen, plus revisions it produced this round.
    baseline: Stamp,
    /// Backend snapshot taken by `get_changes`.
    next: Option<Stamp>,
    /// Changes computed this round and not yet handed out.
    changes: Option<Vec<ChangeRecord>>,
    /// Changes handed out by the last `get_changes` call.
    sent: usize,
    /// Client changes committed under the loaded key.
    committed: Vec<MapRow>,
    /// Client changes recorded this round.
    staged: Vec<MapRow>,
    loaded: bool,
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value).map_err(SyncError::Serialization)?)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)?)
}

impl<S: StateStorage> StateMachine<S> {
    /// Create a state machine for a collection stored in backend folder
    /// `server_id`.
    pub fn new(
        storage: Arc<S>,
        device: DeviceId,
        user: UserId,
        collection: CollectionId,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            device,
            user,
            collection,
            server_id: server_id.into(),
            current: SyncKey::Initial,
            proposed: SyncKey::Initial.next(),
            new_key: None,
            latest_at_load: None,
            baseline: Stamp::default(),
            next: None,
            changes: None,
            sent: 0,
            committed: Vec::new(),
            staged: Vec::new(),
            loaded: false,
        }
    }

    /// Collection this state belongs to.
    pub fn collection(&self) -> &CollectionId {
        &self.collection
    }

    /// Backend folder of the collection.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Key the state was loaded at.
    pub fn current_key(&self) -> &SyncKey {
        &self.current
    }

    /// Snapshot the client is known to have.
    pub fn baseline(&self) -> &Stamp {
        &self.baseline
    }

    /// Load the state recorded under `key`.
    ///
    /// The initial key discards everything recorded for the collection. A
    /// key the server never issued, or one more than a round behind the
    /// newest, fails with an error that forces a resync.
    pub async fn load_state(&mut self, key: &SyncKey) -> Result<()> {
        self.reset_round();
        self.current = key.clone();
        self.proposed = key.next();

        let (series, counter) = match key {
            SyncKey::Initial => {
                let removed = self
                    .storage
                    .reset_collection(&self.device, &self.user, &self.collection)
                    .await?;
                info!(
                    device = %self.device,
                    collection = %self.collection,
                    removed,
                    "initial sync key, collection state reset"
                );
                self.baseline = Stamp::default();
                self.latest_at_load = None;
                self.loaded = true;
                return Ok(());
            }
            SyncKey::Keyed { series, counter } => (series.as_str(), *counter),
        };

        let latest = self
            .storage
            .latest_counter(&self.device, &self.user, &self.collection, series)
            .await?;
        let Some(latest) = latest else {
            return Err(SyncError::InvalidSyncKey(key.to_string()).into());
        };
        if counter.saturating_add(1) < latest {
            warn!(
                device = %self.device,
                collection = %self.collection,
                key = %key,
                latest,
                "sync key regression"
            );
            return Err(SyncError::ProtocolViolation(format!(
                "sync key {} is behind counter {}",
                key, latest
            ))
            .into());
        }

        let row = self
            .storage
            .load_state(&self.device, &self.user, &self.collection, series, counter)
            .await?
            .ok_or_else(|| SyncError::InvalidSyncKey(key.to_string()))?;

        self.baseline = decode(&row.data)?;
        if let Some(pending) = &row.pending {
            let pending: Vec<ChangeRecord> = decode(pending)?;
            if !pending.is_empty() {
                self.changes = Some(pending);
            }
        }
        self.committed = self
            .storage
            .load_map(&self.device, &self.user, &self.collection, series, counter)
            .await?;
        self.latest_at_load = Some(latest);
        self.loaded = true;

        debug!(
            device = %self.device,
            collection = %self.collection,
            key = %key,
            items = self.baseline.items.len(),
            "sync state loaded"
        );
        Ok(())
    }

    fn reset_round(&mut self) {
        self.new_key = None;
        self.next = None;
        self.changes = None;
        self.sent = 0;
        self.committed.clear();
        self.staged.clear();
        self.loaded = false;
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.loaded {
            Ok(())
        } else {
            Err(SyncError::ProtocolViolation("sync state used before load".into()).into())
        }
    }

    /// Decide whether a client operation conflicts with the server's copy.
    ///
    /// `stat` is the backend's current view of the item, `None` when it is
    /// gone.
    pub fn is_conflict(&self, stat: Option<&MessageStat>, change: ChangeType) -> bool {
        let conflict = is_conflict(&self.baseline, stat, change);
        if conflict {
            debug!(
                collection = %self.collection,
                id = stat.map(|s| s.id.as_str()),
                ?change,
                "conflict detected"
            );
        }
        conflict
    }

    /// Record a client change applied to the backend.
    ///
    /// `revision` is the item's revision after the change; content changes
    /// carry it in their payload already.
    pub fn update_state(
        &mut self,
        change: &ChangeRecord,
        revision: Option<u64>,
        client_id: Option<&str>,
    ) {
        let revision = revision.or_else(|| change.revision());
        let change_type = change.change_type();

        match change_type {
            ChangeType::Change | ChangeType::Flags => {
                if let Some(revision) = revision {
                    self.baseline.observe(change.id.clone(), revision);
                }
            }
            ChangeType::Delete | ChangeType::Move => {
                self.baseline.remove(&change.id);
            }
        }

        debug!(
            collection = %self.collection,
            id = %change.id,
            ?change_type,
            "staging client change"
        );
        self.staged.push(MapRow {
            message_id: change.id.clone(),
            client_id: client_id.map(str::to_string),
            change_type,
            revision,
            timestamp: change.timestamp,
        });
    }

    /// Stage the key the round will be saved under.
    ///
    /// The key must directly follow the loaded key.
    pub fn set_new_sync_key(&mut self, key: SyncKey) -> Result<()> {
        let follows = match (&self.current, &key) {
            (SyncKey::Initial, SyncKey::Keyed { counter, .. }) => *counter == 1,
            (current, next) => current.precedes(next) && next.counter() == current.counter() + 1,
        };
        if !follows {
            return Err(SyncError::ProtocolViolation(format!(
                "{} does not follow {}",
                key, self.current
            ))
            .into());
        }
        self.new_key = Some(key);
        Ok(())
    }

    /// The key following the loaded one.
    ///
    /// Stable within a round; the initial key yields a fresh series.
    pub fn get_new_sync_key(&self) -> SyncKey {
        self.new_key.clone().unwrap_or_else(|| self.proposed.clone())
    }

    /// Server id of an addition the client already sent with `client_id`.
    pub async fn is_duplicate_pim_addition(&self, client_id: &str) -> Result<Option<String>> {
        if let Some(row) = self
            .staged
            .iter()
            .find(|row| row.client_id.as_deref() == Some(client_id))
        {
            return Ok(Some(row.message_id.clone()));
        }
        Ok(self
            .storage
            .find_client_id(&self.device, &self.user, &self.collection, client_id)
            .await?)
    }

    fn is_echo(&self, change: &ChangeRecord) -> bool {
        let rows = self.staged.iter().chain(self.committed.iter());
        match &change.payload {
            ChangePayload::Change { revision, .. } => rows
                .filter(|row| row.message_id == change.id)
                .any(|row| {
                    matches!(row.change_type, ChangeType::Change | ChangeType::Flags)
                        && row.revision == Some(*revision)
                }),
            ChangePayload::Delete => rows
                .filter(|row| row.message_id == change.id)
                .any(|row| matches!(row.change_type, ChangeType::Delete | ChangeType::Move)),
            ChangePayload::Flags(_) | ChangePayload::Move { .. } => false,
        }
    }

    async fn compute_changes<D: Driver + ?Sized>(&mut self, driver: &D) -> Result<()> {
        if self.changes.is_some() {
            return Ok(());
        }
        if self.current.is_initial() {
            self.changes = Some(Vec::new());
            return Ok(());
        }

        let current = driver.get_sync_stamp(&self.server_id).await?;
        let delta = current.get_changes(&self.baseline);
        let now = unix_now();

        let mut ordered: Vec<(u64, ChangeRecord)> = Vec::with_capacity(delta.len());
        if current.is_reset(&self.baseline) {
            info!(
                collection = %self.collection,
                "folder snapshot invalidated, sending every item again"
            );
            for id in &delta.added {
                let revision = current.revision_of(id).unwrap_or_default();
                let is_new = self.baseline.revision_of(id).is_none();
                ordered.push((revision, server_change(id, now, revision, is_new)));
            }
            for id in delta.deleted.iter().filter(|id| current.revision_of(id).is_none()) {
                let revision = self.baseline.revision_of(id).unwrap_or_default();
                ordered.push((revision, server_delete(id, now)));
            }
        } else {
            for (ids, is_new) in [(&delta.added, true), (&delta.modified, false)] {
                for id in ids {
                    let revision = current.revision_of(id).unwrap_or_default();
                    ordered.push((revision, server_change(id, now, revision, is_new)));
                }
            }
            for id in &delta.deleted {
                let revision = self.baseline.revision_of(id).unwrap_or_default();
                ordered.push((revision, server_delete(id, now)));
            }
        }

        let total = ordered.len();
        ordered.retain(|(_, change)| !self.is_echo(change));
        ordered.sort_by_key(|(revision, change)| (change.timestamp, *revision));

        debug!(
            collection = %self.collection,
            total,
            echoes = total - ordered.len(),
            "server changes computed"
        );
        self.changes = Some(ordered.into_iter().map(|(_, c)| c).collect());
        self.next = Some(current);
        Ok(())
    }

    /// Number of server changes waiting for the client.
    pub async fn change_count<D: Driver + ?Sized>(&mut self, driver: &D) -> Result<usize> {
        self.ensure_loaded()?;
        self.compute_changes(driver).await?;
        Ok(self.changes.as_ref().map_or(0, Vec::len).saturating_sub(self.sent))
    }

    /// Server changes for this round, oldest first, at most `window`.
    ///
    /// Changes left over from an earlier round are sent before the backend
    /// is consulted again. Whatever does not fit the window is kept for the
    /// next round. The initial key never yields changes.
    pub async fn get_changes<D: Driver + ?Sized>(
        &mut self,
        driver: &D,
        window: Option<usize>,
    ) -> Result<Vec<ChangeRecord>> {
        self.ensure_loaded()?;
        self.compute_changes(driver).await?;

        let all = self.changes.as_deref().unwrap_or_default();
        let remaining = &all[self.sent.min(all.len())..];
        let take = window.map_or(remaining.len(), |w| w.min(remaining.len()));
        let batch = remaining[..take].to_vec();
        self.sent += take;
        Ok(batch)
    }

    /// Check whether changes remain after the last `get_changes` call.
    pub fn more_available(&self) -> bool {
        self.changes
            .as_ref()
            .is_some_and(|changes| changes.len() > self.sent)
    }

    /// Commit the staged key, the folder snapshot and the change map.
    pub async fn save(&mut self) -> Result<()> {
        self.ensure_loaded()?;
        let key = self.get_new_sync_key();
        let SyncKey::Keyed { series, counter } = &key else {
            return Err(SyncError::InvalidSyncKey(key.to_string()).into());
        };

        // Without a server pass the client still has the loaded snapshot
        // plus its own changes.
        let snapshot = self.next.as_ref().unwrap_or(&self.baseline);
        let pending: &[ChangeRecord] = match &self.changes {
            Some(changes) => &changes[self.sent.min(changes.len())..],
            None => &[],
        };

        let row = StateRow {
            device_id: self.device.clone(),
            user_id: self.user.clone(),
            folder_id: self.collection.clone(),
            series: series.clone(),
            counter: *counter,
            data: encode(snapshot)?,
            pending: if pending.is_empty() {
                None
            } else {
                Some(encode(&pending)?)
            },
            sync_time: unix_now(),
        };
        let expected_latest = if self.current.series() == Some(series.as_str()) {
            self.latest_at_load
        } else {
            None
        };

        let outcome = self
            .storage
            .commit_state(StateCommit {
                row,
                expected_latest,
                map: self.staged.clone(),
            })
            .await?;

        match outcome {
            CommitOutcome::Committed => {
                info!(
                    device = %self.device,
                    collection = %self.collection,
                    key = %key,
                    client_changes = self.staged.len(),
                    pending = pending.len(),
                    "sync key committed"
                );
                self.staged.clear();
                Ok(())
            }
            CommitOutcome::Stale { latest } => {
                warn!(
                    device = %self.device,
                    collection = %self.collection,
                    key = %key,
                    ?latest,
                    "sync key advanced concurrently"
                );
                Err(SyncError::StaleState {
                    collection: self.collection.to_string(),
                }
                .into())
            }
        }
    }

    /// Forget every key and change recorded for the collection.
    pub async fn remove_state(&mut self) -> Result<()> {
        let removed = self
            .storage
            .reset_collection(&self.device, &self.user, &self.collection)
            .await?;
        info!(
            device = %self.device,
            collection = %self.collection,
            removed,
            "sync state removed"
        );
        self.reset_round();
        self.current = SyncKey::Initial;
        self.proposed = SyncKey::Initial.next();
        self.baseline = Stamp::default();
        self.latest_at_load = None;
        Ok(())
    }
}

fn server_change(id: &str, timestamp: i64, revision: u64, is_new: bool) -> ChangeRecord {
    ChangeRecord {
        id: id.to_string(),
        origin: ChangeOrigin::Server,
        timestamp,
        payload: ChangePayload::Change { revision, is_new },
    }
}

fn server_delete(id: &str, timestamp: i64) -> ChangeRecord {
    ChangeRecord {
        id: id.to_string(),
        origin: ChangeOrigin::Server,
        timestamp,
        payload: ChangePayload::Delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockDriver;
    use crate::storage::SqliteStorage;
    use eas_sync_types::{FlagChange, SyncMessage, SyncStatus};

    struct Fixture {
        storage: Arc<SqliteStorage>,
        driver: MockDriver,
    }

    impl Fixture {
        async fn new() -> Self {
            let driver = MockDriver::new();
            driver.add_folder("INBOX");
            Self {
                storage: Arc::new(SqliteStorage::in_memory().await.unwrap()),
                driver,
            }
        }

        fn machine(&self) -> StateMachine<SqliteStorage> {
            StateMachine::new(
                Arc::clone(&self.storage),
                DeviceId::new("dev123"),
                UserId::new("mike"),
                CollectionId::new("INBOX"),
                "INBOX",
            )
        }

        /// Run a round at `key` sending everything; returns the next key.
        async fn round(&self, key: &SyncKey) -> (SyncKey, Vec<ChangeRecord>) {
            let mut state = self.machine();
            state.load_state(key).await.unwrap();
            let changes = state.get_changes(&self.driver, None).await.unwrap();
            let next = state.get_new_sync_key();
            state.save().await.unwrap();
            (next, changes)
        }
    }

    fn ids(changes: &[ChangeRecord]) -> Vec<&str> {
        changes.iter().map(|c| c.id.as_str()).collect()
    }

    #[tokio::test]
    async fn initial_round_sends_nothing_then_everything() {
        let fx = Fixture::new().await;
        fx.driver.add_message("INBOX", "1", SyncMessage::default());
        fx.driver.add_message("INBOX", "2", SyncMessage::default());

        let (k1, changes) = fx.round(&SyncKey::Initial).await;
        assert!(changes.is_empty());
        assert_eq!(k1.counter(), 1);

        let (k2, changes) = fx.round(&k1).await;
        assert_eq!(ids(&changes), vec!["1", "2"]);
        assert!(changes.iter().all(|c| matches!(
            c.payload,
            ChangePayload::Change { is_new: true, .. }
        )));
        assert!(k1.precedes(&k2));

        let (_, changes) = fx.round(&k2).await;
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn server_edits_and_deletes_are_reported_in_order() {
        let fx = Fixture::new().await;
        fx.driver.add_message("INBOX", "1", SyncMessage::default());
        fx.driver.add_message("INBOX", "2", SyncMessage::default());
        let (k1, _) = fx.round(&SyncKey::Initial).await;
        let (k2, _) = fx.round(&k1).await;

        fx.driver.remove("INBOX", "1");
        fx.driver.touch("INBOX", "2");
        fx.driver.add_message("INBOX", "3", SyncMessage::default());

        let (_, changes) = fx.round(&k2).await;
        assert_eq!(ids(&changes), vec!["1", "2", "3"]);
        assert_eq!(changes[0].payload, ChangePayload::Delete);
        assert!(matches!(
            changes[1].payload,
            ChangePayload::Change { is_new: false, .. }
        ));
        assert!(matches!(
            changes[2].payload,
            ChangePayload::Change { is_new: true, .. }
        ));
    }

    #[tokio::test]
    async fn window_keeps_remainder_pending() {
        let fx = Fixture::new().await;
        for id in ["1", "2", "3"] {
            fx.driver.add_message("INBOX", id, SyncMessage::default());
        }
        let (k1, _) = fx.round(&SyncKey::Initial).await;

        let mut state = fx.machine();
        state.load_state(&k1).await.unwrap();
        assert_eq!(state.change_count(&fx.driver).await.unwrap(), 3);
        let first = state.get_changes(&fx.driver, Some(2)).await.unwrap();
        assert_eq!(ids(&first), vec!["1", "2"]);
        assert!(state.more_available());
        let k2 = state.get_new_sync_key();
        state.save().await.unwrap();

        // A new server item waits until the pending change is delivered.
        fx.driver.add_message("INBOX", "4", SyncMessage::default());
        let mut state = fx.machine();
        state.load_state(&k2).await.unwrap();
        let second = state.get_changes(&fx.driver, Some(2)).await.unwrap();
        assert_eq!(ids(&second), vec!["3"]);
        assert!(!state.more_available());
        let k3 = state.get_new_sync_key();
        state.save().await.unwrap();

        let (_, third) = fx.round(&k3).await;
        assert_eq!(ids(&third), vec!["4"]);
    }

    #[tokio::test]
    async fn client_changes_are_not_echoed() {
        let fx = Fixture::new().await;
        fx.driver.add_message("INBOX", "1", SyncMessage::default());
        fx.driver.add_message("INBOX", "2", SyncMessage::default());
        let (k1, _) = fx.round(&SyncKey::Initial).await;
        let (k2, _) = fx.round(&k1).await;

        let mut state = fx.machine();
        state.load_state(&k2).await.unwrap();
        let stat = fx
            .driver
            .change_message("INBOX", Some("1"), &SyncMessage::default().with("subject", "x"))
            .await
            .unwrap();
        state.update_state(
            &ChangeRecord::new(
                "1",
                ChangeOrigin::Pim,
                ChangePayload::Change {
                    revision: stat.revision,
                    is_new: false,
                },
            ),
            None,
            None,
        );
        fx.driver
            .delete_message("INBOX", &["2".to_string()])
            .await
            .unwrap();
        state.update_state(
            &ChangeRecord::new("2", ChangeOrigin::Pim, ChangePayload::Delete),
            None,
            None,
        );
        let k3 = state.get_new_sync_key();
        state.save().await.unwrap();

        // The import round did not ask for changes; the next one must not
        // report the client's own edits back.
        let (_, changes) = fx.round(&k3).await;
        assert!(changes.is_empty(), "unexpected echo: {:?}", changes);
    }

    #[tokio::test]
    async fn flag_change_is_not_echoed_in_same_round() {
        let fx = Fixture::new().await;
        fx.driver.add_message("INBOX", "1", SyncMessage::default());
        let (k1, _) = fx.round(&SyncKey::Initial).await;
        let (k2, _) = fx.round(&k1).await;

        let mut state = fx.machine();
        state.load_state(&k2).await.unwrap();
        let stat = fx.driver.set_read_flag("INBOX", "1", true).await.unwrap();
        state.update_state(
            &ChangeRecord::new(
                "1",
                ChangeOrigin::Pim,
                ChangePayload::Flags(FlagChange::read(true)),
            ),
            Some(stat.revision),
            None,
        );
        assert!(state.get_changes(&fx.driver, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_key_never_regresses() {
        let fx = Fixture::new().await;
        let (k1, _) = fx.round(&SyncKey::Initial).await;
        let (k2, _) = fx.round(&k1).await;
        let (k3, _) = fx.round(&k2).await;

        let mut state = fx.machine();
        let err = state.load_state(&k1).await.unwrap_err();
        assert!(err.requires_resync());
        assert_eq!(err.status(), SyncStatus::InvalidSyncKey);

        // One round behind is a retry and still loads.
        state.load_state(&k2).await.unwrap();
        assert_eq!(state.get_new_sync_key(), k3);
    }

    #[tokio::test]
    async fn unknown_key_is_invalid() {
        let fx = Fixture::new().await;
        let mut state = fx.machine();
        let err = state
            .load_state(&"{nope}4".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.requires_resync());
    }

    #[tokio::test]
    async fn concurrent_advance_is_stale() {
        let fx = Fixture::new().await;
        let (k1, _) = fx.round(&SyncKey::Initial).await;

        let mut a = fx.machine();
        let mut b = fx.machine();
        a.load_state(&k1).await.unwrap();
        b.load_state(&k1).await.unwrap();

        a.save().await.unwrap();
        let err = b.save().await.unwrap_err();
        assert!(err.requires_resync());
        assert!(matches!(
            err,
            crate::error::StateError::Sync(SyncError::StaleState { .. })
        ));
    }

    #[tokio::test]
    async fn retried_round_replaces_previous_attempt() {
        let fx = Fixture::new().await;
        fx.driver.add_message("INBOX", "1", SyncMessage::default());
        let (k1, _) = fx.round(&SyncKey::Initial).await;

        let (k2, first) = fx.round(&k1).await;
        // The client never saw the response and retries with k1.
        let (k2_again, second) = fx.round(&k1).await;
        assert_eq!(k2, k2_again);
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn new_key_must_follow_loaded_key() {
        let fx = Fixture::new().await;
        let (k1, _) = fx.round(&SyncKey::Initial).await;

        let mut state = fx.machine();
        state.load_state(&k1).await.unwrap();
        assert!(state.set_new_sync_key(k1.next().next()).is_err());
        assert!(state.set_new_sync_key(SyncKey::new_series()).is_err());
        state.set_new_sync_key(k1.next()).unwrap();
        assert_eq!(state.get_new_sync_key(), k1.next());
    }

    #[tokio::test]
    async fn duplicate_client_id_found_after_commit() {
        let fx = Fixture::new().await;
        let (k1, _) = fx.round(&SyncKey::Initial).await;

        let mut state = fx.machine();
        state.load_state(&k1).await.unwrap();
        assert_eq!(state.is_duplicate_pim_addition("c1").await.unwrap(), None);
        state.update_state(
            &ChangeRecord::new(
                "7",
                ChangeOrigin::Pim,
                ChangePayload::Change {
                    revision: 3,
                    is_new: true,
                },
            ),
            None,
            Some("c1"),
        );
        assert_eq!(
            state.is_duplicate_pim_addition("c1").await.unwrap(),
            Some("7".to_string())
        );
        state.save().await.unwrap();

        let fresh = fx.machine();
        assert_eq!(
            fresh.is_duplicate_pim_addition("c1").await.unwrap(),
            Some("7".to_string())
        );
    }

    #[tokio::test]
    async fn validity_change_resends_everything() {
        let fx = Fixture::new().await;
        fx.driver.add_message("INBOX", "1", SyncMessage::default());
        let (k1, _) = fx.round(&SyncKey::Initial).await;
        let (k2, _) = fx.round(&k1).await;

        fx.driver.reset_validity("INBOX");
        let (_, changes) = fx.round(&k2).await;
        assert_eq!(ids(&changes), vec!["1"]);
        assert!(matches!(
            changes[0].payload,
            ChangePayload::Change { is_new: false, .. }
        ));
    }

    #[tokio::test]
    async fn initial_key_resets_collection() {
        let fx = Fixture::new().await;
        let (k1, _) = fx.round(&SyncKey::Initial).await;
        let (k2, _) = fx.round(&k1).await;

        let mut state = fx.machine();
        state.load_state(&SyncKey::Initial).await.unwrap();
        assert!(state.get_new_sync_key().series() != k2.series());

        let mut old = fx.machine();
        assert!(old.load_state(&k2).await.is_err());
    }

    #[tokio::test]
    async fn remove_state_forgets_keys() {
        let fx = Fixture::new().await;
        let (k1, _) = fx.round(&SyncKey::Initial).await;

        let mut state = fx.machine();
        state.load_state(&k1).await.unwrap();
        state.remove_state().await.unwrap();
        assert!(state.current_key().is_initial());
        assert!(fx.machine().load_state(&k1).await.is_err());
    }

    #[tokio::test]
    async fn unloaded_state_refuses_work() {
        let fx = Fixture::new().await;
        let mut state = fx.machine();
        assert!(state.get_changes(&fx.driver, None).await.is_err());
        assert!(state.save().await.is_err());
    }
}
