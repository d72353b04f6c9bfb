//! Change log entries and backend item payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{CollectionId, SyncError};

/// Kind of change, used for conflict checks and state updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    /// Item added or modified.
    Change,
    /// Item removed.
    Delete,
    /// Only flags (read, follow-up) changed.
    Flags,
    /// Item moved to another folder.
    Move,
}

/// Who originated a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// Imported from the client device.
    Pim,
    /// Detected on the backend.
    Server,
    /// Not attributed.
    Na,
}

/// Follow-up flag state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlagStatus {
    /// No flag.
    Clear,
    /// Completed.
    Complete,
    /// Flagged for follow-up.
    Active,
}

/// A flag-only modification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagChange {
    /// New read state, if changed.
    pub read: Option<bool>,
    /// New follow-up flag, if changed.
    pub flagged: Option<FlagStatus>,
}

impl FlagChange {
    /// A read-state change.
    pub fn read(read: bool) -> Self {
        Self {
            read: Some(read),
            flagged: None,
        }
    }

    /// A follow-up flag change.
    pub fn flagged(status: FlagStatus) -> Self {
        Self {
            read: None,
            flagged: Some(status),
        }
    }

    /// Check whether nothing is changed.
    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.flagged.is_none()
    }
}

/// Typed payload carried by a [`ChangeRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangePayload {
    /// Content change.
    Change {
        /// Backend revision marker after the change.
        revision: u64,
        /// Whether the item is new to the client.
        is_new: bool,
    },
    /// Removal.
    Delete,
    /// Flag-only change.
    Flags(FlagChange),
    /// Move between folders.
    Move {
        /// Source folder.
        from: CollectionId,
        /// Destination folder.
        to: CollectionId,
        /// Identifier of the item in the destination folder.
        new_id: String,
    },
}

/// One entry of a collection's change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Item identifier within the collection.
    pub id: String,
    /// Who originated the change.
    pub origin: ChangeOrigin,
    /// Unix timestamp (seconds) at which the change was observed.
    pub timestamp: i64,
    /// What changed.
    pub payload: ChangePayload,
}

impl ChangeRecord {
    /// Create a record stamped with the current time.
    pub fn new(id: impl Into<String>, origin: ChangeOrigin, payload: ChangePayload) -> Self {
        Self {
            id: id.into(),
            origin,
            timestamp: crate::unix_now(),
            payload,
        }
    }

    /// The kind of change this record carries.
    pub fn change_type(&self) -> ChangeType {
        match self.payload {
            ChangePayload::Change { .. } => ChangeType::Change,
            ChangePayload::Delete => ChangeType::Delete,
            ChangePayload::Flags(_) => ChangeType::Flags,
            ChangePayload::Move { .. } => ChangeType::Move,
        }
    }

    /// Revision marker carried by content changes.
    pub fn revision(&self) -> Option<u64> {
        match self.payload {
            ChangePayload::Change { revision, .. } => Some(revision),
            _ => None,
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

/// Backend view of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStat {
    /// Item identifier.
    pub id: String,
    /// Revision marker; changes whenever the item changes.
    pub revision: u64,
    /// Current flag state.
    pub flags: FlagChange,
}

/// Application data of an item exchanged with the backend.
///
/// Properties are kept as ordered name/value pairs; their meaning depends on
/// the collection class and is left to the backend and wire encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Class-specific properties.
    pub properties: BTreeMap<String, String>,
    /// Category labels.
    pub categories: Vec<String>,
    /// Flag state carried with the message.
    pub flags: FlagChange,
}

impl SyncMessage {
    /// Builder-style property setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_type_follows_payload() {
        let change = ChangeRecord::new(
            "1",
            ChangeOrigin::Server,
            ChangePayload::Change {
                revision: 4,
                is_new: true,
            },
        );
        assert_eq!(change.change_type(), ChangeType::Change);
        assert_eq!(change.revision(), Some(4));

        let delete = ChangeRecord::new("1", ChangeOrigin::Pim, ChangePayload::Delete);
        assert_eq!(delete.change_type(), ChangeType::Delete);
        assert_eq!(delete.revision(), None);
    }

    #[test]
    fn payload_is_tagged_in_json() {
        let record = ChangeRecord {
            id: "42".into(),
            origin: ChangeOrigin::Pim,
            timestamp: 10,
            payload: ChangePayload::Flags(FlagChange::read(true)),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["payload"]["kind"], "flags");
        assert_eq!(json["payload"]["read"], true);
    }

    #[test]
    fn record_survives_messagepack() {
        let record = ChangeRecord::new(
            "a",
            ChangeOrigin::Pim,
            ChangePayload::Move {
                from: "INBOX".into(),
                to: "Archive".into(),
                new_id: "b".into(),
            },
        );
        let bytes = record.to_bytes().unwrap();
        assert_eq!(ChangeRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn flag_change_helpers() {
        assert!(FlagChange::default().is_empty());
        assert!(!FlagChange::read(false).is_empty());
        assert_eq!(
            FlagChange::flagged(FlagStatus::Active).flagged,
            Some(FlagStatus::Active)
        );
    }
}
