//! Applies client changes to the backend.
//!
//! Each operation checks for conflicts where the rule asks for it, calls the
//! [`Driver`], and records what was applied in the collection's
//! [`StateMachine`] so the change is not echoed back to the client.
//!
//! Backend failures are reported per item in the returned outcome; only
//! storage failures abort with an error.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use eas_sync_types::{
    ChangeOrigin, ChangePayload, ChangeRecord, ChangeType, CollectionId, ConflictPolicy,
    FlagChange, FlagStatus, MessageStat, SyncMessage, SyncStatus,
};

use crate::backend::{Driver, DriverError};
use crate::error::Result;
use crate::state::StateMachine;
use crate::storage::StateStorage;

/// Result of importing one client change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Applied; the server id of the item.
    Applied {
        /// Server id.
        id: String,
    },
    /// Rejected because the server's copy changed; the server version is
    /// sent on the next round instead.
    Conflict {
        /// Server id.
        id: String,
        /// Status reported for the item.
        status: SyncStatus,
    },
    /// The backend refused the change.
    Failed {
        /// Status reported for the item.
        status: SyncStatus,
    },
    /// The backend does not support this kind of change.
    Ignored,
}

impl ImportOutcome {
    /// Server id for applied or conflicting changes.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Applied { id } | Self::Conflict { id, .. } => Some(id),
            Self::Failed { .. } | Self::Ignored => None,
        }
    }
}

/// Result of a bulk deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResult {
    /// Ids actually deleted.
    pub deleted: Vec<String>,
    /// Ids the backend failed on, with the status reported for each.
    pub failed: BTreeMap<String, SyncStatus>,
}

/// Result of a bulk move.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveResult {
    /// Old id to new id for every item moved.
    pub results: BTreeMap<String, String>,
    /// Ids that were not found on the backend.
    pub missing: Vec<String>,
    /// Ids the backend failed on, with the status reported for each.
    pub failed: BTreeMap<String, SyncStatus>,
}

/// Imports client changes into one collection.
pub struct Importer<'a, S: StateStorage, D: Driver + ?Sized> {
    state: &'a mut StateMachine<S>,
    driver: &'a D,
    conflict: Option<ConflictPolicy>,
}

impl<'a, S: StateStorage, D: Driver + ?Sized> Importer<'a, S, D> {
    /// Create an importer for the collection `state` was loaded for.
    ///
    /// Conflicts are only checked when the client asked for
    /// [`ConflictPolicy::OverwritePim`].
    pub fn new(
        state: &'a mut StateMachine<S>,
        driver: &'a D,
        conflict: Option<ConflictPolicy>,
    ) -> Self {
        Self {
            state,
            driver,
            conflict,
        }
    }

    fn folder(&self) -> String {
        self.state.server_id().to_string()
    }

    /// Import an added (`id` = `None`) or modified item.
    ///
    /// A repeated addition with a known `client_id` returns the id created
    /// the first time without touching the backend again.
    pub async fn import_message_change(
        &mut self,
        id: Option<&str>,
        message: &SyncMessage,
        client_id: Option<&str>,
    ) -> Result<ImportOutcome> {
        let folder = self.folder();

        if let Some(id) = id {
            if self.conflict == Some(ConflictPolicy::OverwritePim) {
                let stat = match self.driver.stat(&folder, id).await {
                    Ok(stat) => stat,
                    Err(e) => return Ok(failed("stat", id, e)),
                };
                if self.state.is_conflict(stat.as_ref(), ChangeType::Change) {
                    warn!(folder = %folder, id, "client change conflicts with server copy");
                    return Ok(ImportOutcome::Conflict {
                        id: id.to_string(),
                        status: SyncStatus::Conflict,
                    });
                }
            }
        } else if let Some(client_id) = client_id {
            if let Some(existing) = self.state.is_duplicate_pim_addition(client_id).await? {
                debug!(folder = %folder, client_id, id = %existing, "duplicate client addition");
                // Keep the mapping alive under the new key.
                match self.driver.stat(&folder, &existing).await {
                    Ok(Some(stat)) => self.record_change(&stat, true, Some(client_id)),
                    Ok(None) => {}
                    Err(e) => return Ok(failed("stat", &existing, e)),
                }
                return Ok(ImportOutcome::Applied { id: existing });
            }
        }

        let stat = match self.driver.change_message(&folder, id, message).await {
            Ok(stat) => stat,
            Err(e) => return Ok(failed("change_message", id.unwrap_or_default(), e)),
        };
        self.record_change(&stat, id.is_none(), client_id);
        Ok(ImportOutcome::Applied { id: stat.id })
    }

    fn record_change(&mut self, stat: &MessageStat, is_new: bool, client_id: Option<&str>) {
        let change = ChangeRecord::new(
            stat.id.clone(),
            ChangeOrigin::Pim,
            ChangePayload::Change {
                revision: stat.revision,
                is_new,
            },
        );
        self.state.update_state(&change, None, client_id);
    }

    /// Delete items.
    ///
    /// Deletions never conflict. When the backend call fails every id is
    /// reported in [`DeleteResult::failed`] with the error's status.
    pub async fn import_message_deletion(&mut self, ids: &[String]) -> Result<DeleteResult> {
        let folder = self.folder();
        let deleted = match self.driver.delete_message(&folder, ids).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(folder = %folder, count = ids.len(), error = %e, "client deletion failed");
                return Ok(DeleteResult {
                    deleted: Vec::new(),
                    failed: fail_all(ids, &e),
                });
            }
        };

        for id in &deleted {
            let change = ChangeRecord::new(id.clone(), ChangeOrigin::Pim, ChangePayload::Delete);
            self.state.update_state(&change, None, None);
        }
        Ok(DeleteResult {
            deleted,
            failed: BTreeMap::new(),
        })
    }

    /// Move items to another folder.
    ///
    /// Items the backend did not move are reported in
    /// [`MoveResult::missing`] without failing the others. A failed backend
    /// call reports every id in [`MoveResult::failed`] instead.
    pub async fn import_message_move(
        &mut self,
        ids: &[String],
        destination: &str,
    ) -> Result<MoveResult> {
        let folder = self.folder();
        let results = match self.driver.move_messages(&folder, ids, destination).await {
            Ok(results) => results,
            Err(e) => {
                warn!(folder = %folder, destination, error = %e, "client move failed");
                return Ok(MoveResult {
                    failed: fail_all(ids, &e),
                    ..MoveResult::default()
                });
            }
        };

        let from = self.state.collection().clone();
        let to = CollectionId::new(destination);
        for (old_id, new_id) in &results {
            let change = ChangeRecord::new(
                old_id.clone(),
                ChangeOrigin::Pim,
                ChangePayload::Move {
                    from: from.clone(),
                    to: to.clone(),
                    new_id: new_id.clone(),
                },
            );
            self.state.update_state(&change, None, None);
        }

        let missing = ids
            .iter()
            .filter(|id| !results.contains_key(*id))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            debug!(folder = %folder, missing = missing.len(), "some moved items were not found");
        }
        Ok(MoveResult {
            results,
            missing,
            failed: BTreeMap::new(),
        })
    }

    /// Change the read state of an item. Never conflicts.
    pub async fn import_message_read_flag(&mut self, id: &str, read: bool) -> Result<ImportOutcome> {
        let folder = self.folder();
        let result = self.driver.set_read_flag(&folder, id, read).await;
        Ok(self.record_flags(id, FlagChange::read(read), "set_read_flag", result))
    }

    /// Change the follow-up flag of an item. Never conflicts.
    pub async fn import_message_flag(
        &mut self,
        id: &str,
        status: FlagStatus,
    ) -> Result<ImportOutcome> {
        let folder = self.folder();
        let result = self.driver.set_flag(&folder, id, status).await;
        Ok(self.record_flags(id, FlagChange::flagged(status), "set_flag", result))
    }

    fn record_flags(
        &mut self,
        id: &str,
        flags: FlagChange,
        op: &'static str,
        result: std::result::Result<MessageStat, DriverError>,
    ) -> ImportOutcome {
        match result {
            Ok(stat) => {
                let change =
                    ChangeRecord::new(stat.id.clone(), ChangeOrigin::Pim, ChangePayload::Flags(flags));
                self.state.update_state(&change, Some(stat.revision), None);
                ImportOutcome::Applied { id: stat.id }
            }
            Err(e) if e.is_unsupported() => {
                debug!(op, id, "flag change not supported by backend");
                ImportOutcome::Ignored
            }
            Err(e) => failed(op, id, e),
        }
    }
}

fn fail_all(ids: &[String], error: &DriverError) -> BTreeMap<String, SyncStatus> {
    ids.iter().map(|id| (id.clone(), error.status())).collect()
}

fn failed(op: &'static str, id: &str, error: DriverError) -> ImportOutcome {
    warn!(op, id, error = %error, "backend rejected client change");
    ImportOutcome::Failed {
        status: error.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockDriver;
    use crate::storage::SqliteStorage;
    use eas_sync_types::{DeviceId, SyncKey, UserId};
    use std::sync::Arc;

    async fn loaded_state(driver: &MockDriver) -> StateMachine<SqliteStorage> {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let machine = || {
            StateMachine::new(
                Arc::clone(&storage),
                DeviceId::new("dev123"),
                UserId::new("mike"),
                CollectionId::new("INBOX"),
                "INBOX",
            )
        };

        // Two rounds: the client now holds every current item.
        let mut state = machine();
        state.load_state(&SyncKey::Initial).await.unwrap();
        let k1 = state.get_new_sync_key();
        state.save().await.unwrap();

        let mut state = machine();
        state.load_state(&k1).await.unwrap();
        state.get_changes(driver, None).await.unwrap();
        let k2 = state.get_new_sync_key();
        state.save().await.unwrap();

        let mut state = machine();
        state.load_state(&k2).await.unwrap();
        state
    }

    fn msg(subject: &str) -> SyncMessage {
        SyncMessage::default().with("Subject", subject)
    }

    #[tokio::test]
    async fn vanished_item_is_conflict_under_overwrite_pim() {
        let driver = MockDriver::new();
        driver.add_message("INBOX", "42", msg("a"));
        let mut state = loaded_state(&driver).await;
        driver.remove("INBOX", "42");

        let mut importer =
            Importer::new(&mut state, &driver, Some(ConflictPolicy::OverwritePim));
        let outcome = importer
            .import_message_change(Some("42"), &msg("edit"), None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ImportOutcome::Conflict {
                id: "42".into(),
                status: SyncStatus::Conflict
            }
        );
    }

    #[tokio::test]
    async fn server_edit_conflicts_only_when_requested() {
        let driver = MockDriver::new();
        driver.add_message("INBOX", "42", msg("a"));
        let mut state = loaded_state(&driver).await;
        driver.touch("INBOX", "42");

        let mut importer =
            Importer::new(&mut state, &driver, Some(ConflictPolicy::OverwritePim));
        let outcome = importer
            .import_message_change(Some("42"), &msg("edit"), None)
            .await
            .unwrap();
        assert!(matches!(outcome, ImportOutcome::Conflict { .. }));

        let mut importer =
            Importer::new(&mut state, &driver, Some(ConflictPolicy::OverwriteServer));
        let outcome = importer
            .import_message_change(Some("42"), &msg("edit"), None)
            .await
            .unwrap();
        assert_eq!(outcome, ImportOutcome::Applied { id: "42".into() });
        assert_eq!(driver.message("INBOX", "42"), Some(msg("edit")));
    }

    #[tokio::test]
    async fn unchanged_item_is_applied() {
        let driver = MockDriver::new();
        driver.add_message("INBOX", "42", msg("a"));
        let mut state = loaded_state(&driver).await;

        let mut importer =
            Importer::new(&mut state, &driver, Some(ConflictPolicy::OverwritePim));
        let outcome = importer
            .import_message_change(Some("42"), &msg("edit"), None)
            .await
            .unwrap();
        assert_eq!(outcome.id(), Some("42"));
    }

    #[tokio::test]
    async fn duplicate_addition_creates_one_item() {
        let driver = MockDriver::new();
        driver.add_folder("INBOX");
        let mut state = loaded_state(&driver).await;

        let mut importer = Importer::new(&mut state, &driver, None);
        let first = importer
            .import_message_change(None, &msg("new"), Some("c1"))
            .await
            .unwrap();
        let second = importer
            .import_message_change(None, &msg("new"), Some("c1"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(driver.created_count(), 1);
        assert_eq!(driver.item_count("INBOX"), 1);
    }

    #[tokio::test]
    async fn deletions_record_only_deleted_ids() {
        let driver = MockDriver::new();
        driver.add_message("INBOX", "1", msg("a"));
        driver.add_message("INBOX", "2", msg("b"));
        let mut state = loaded_state(&driver).await;
        driver.touch("INBOX", "1");

        let mut importer =
            Importer::new(&mut state, &driver, Some(ConflictPolicy::OverwritePim));
        // A server edit does not stop a deletion.
        let deleted = importer
            .import_message_deletion(&["1".into(), "9".into()])
            .await
            .unwrap();
        assert_eq!(deleted.deleted, vec!["1".to_string()]);
        assert!(deleted.failed.is_empty());
        assert_eq!(driver.item_count("INBOX"), 1);
    }

    #[tokio::test]
    async fn failed_deletion_reports_server_error() {
        let driver = MockDriver::new();
        driver.add_message("INBOX", "2", msg("b"));
        driver.add_message("INBOX", "3", msg("c"));
        let mut state = loaded_state(&driver).await;

        let mut importer = Importer::new(&mut state, &driver, None);
        driver.fail_next(DriverError::Backend("down".into()));
        let result = importer
            .import_message_deletion(&["2".into(), "3".into()])
            .await
            .unwrap();

        assert!(result.deleted.is_empty());
        assert_eq!(result.failed.len(), 2);
        assert_eq!(result.failed.get("2"), Some(&SyncStatus::ServerError));
        assert_eq!(result.failed.get("3"), Some(&SyncStatus::ServerError));
        assert_eq!(driver.item_count("INBOX"), 2);
    }

    #[tokio::test]
    async fn move_reports_missing_ids() {
        let driver = MockDriver::new();
        driver.add_message("INBOX", "a", msg("a"));
        driver.add_folder("dest");
        let mut state = loaded_state(&driver).await;

        let mut importer = Importer::new(&mut state, &driver, None);
        let result = importer
            .import_message_move(&["a".into(), "b".into()], "dest")
            .await
            .unwrap();

        assert_eq!(result.missing, vec!["b".to_string()]);
        assert_eq!(result.results.len(), 1);
        assert!(result.results.contains_key("a"));
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn failed_move_is_not_reported_missing() {
        let driver = MockDriver::new();
        driver.add_message("INBOX", "a", msg("a"));
        driver.add_folder("dest");
        let mut state = loaded_state(&driver).await;

        let mut importer = Importer::new(&mut state, &driver, None);
        driver.fail_next(DriverError::Backend("down".into()));
        let result = importer
            .import_message_move(&["a".into()], "dest")
            .await
            .unwrap();

        assert!(result.results.is_empty());
        assert!(result.missing.is_empty());
        assert_eq!(result.failed.get("a"), Some(&SyncStatus::ServerError));
        assert_eq!(driver.item_count("INBOX"), 1);
    }

    #[tokio::test]
    async fn duplicate_addition_surfaces_stat_failure() {
        let driver = MockDriver::new();
        driver.add_folder("INBOX");
        let mut state = loaded_state(&driver).await;

        let mut importer = Importer::new(&mut state, &driver, None);
        let first = importer
            .import_message_change(None, &msg("new"), Some("c1"))
            .await
            .unwrap();
        assert!(first.id().is_some());

        driver.fail_next(DriverError::Backend("down".into()));
        let second = importer
            .import_message_change(None, &msg("new"), Some("c1"))
            .await
            .unwrap();
        assert_eq!(
            second,
            ImportOutcome::Failed {
                status: SyncStatus::ServerError
            }
        );
        assert_eq!(driver.created_count(), 1);
    }

    #[tokio::test]
    async fn flags_never_conflict() {
        let driver = MockDriver::new();
        driver.add_message("INBOX", "42", msg("a"));
        let mut state = loaded_state(&driver).await;
        driver.touch("INBOX", "42");

        let mut importer =
            Importer::new(&mut state, &driver, Some(ConflictPolicy::OverwritePim));
        let read = importer.import_message_read_flag("42", true).await.unwrap();
        assert_eq!(read, ImportOutcome::Applied { id: "42".into() });
        let flag = importer
            .import_message_flag("42", FlagStatus::Active)
            .await
            .unwrap();
        assert_eq!(flag.id(), Some("42"));

        let message = driver.message("INBOX", "42").unwrap();
        assert_eq!(message.flags.read, Some(true));
        assert_eq!(message.flags.flagged, Some(FlagStatus::Active));
    }

    #[tokio::test]
    async fn backend_failure_is_per_item() {
        let driver = MockDriver::new();
        driver.add_message("INBOX", "42", msg("a"));
        let mut state = loaded_state(&driver).await;

        let mut importer = Importer::new(&mut state, &driver, None);
        driver.fail_next(DriverError::Conversion("bad date".into()));
        let outcome = importer
            .import_message_change(Some("42"), &msg("x"), None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ImportOutcome::Failed {
                status: SyncStatus::ConversionError
            }
        );

        let outcome = importer.import_message_read_flag("nope", true).await.unwrap();
        assert_eq!(
            outcome,
            ImportOutcome::Failed {
                status: SyncStatus::ObjectNotFound
            }
        );
    }
}
