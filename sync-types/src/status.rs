//! Protocol status codes and collection enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-collection status reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SyncStatus {
    /// Round completed.
    Success = 1,
    /// Client protocol version is not supported.
    VersionMismatch = 2,
    /// Sync key unknown, stale or regressed. The client must resync from `0`.
    InvalidSyncKey = 3,
    /// Malformed client request.
    ProtocolError = 4,
    /// Backend failure.
    ServerError = 5,
    /// Client object could not be converted for the backend.
    ConversionError = 6,
    /// Client and server both modified the object.
    Conflict = 7,
    /// Referenced object does not exist on the server.
    ObjectNotFound = 8,
    /// Folder hierarchy changed; a folder sync is required first.
    FolderHierarchyChanged = 12,
}

impl SyncStatus {
    /// Numeric wire value.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the client must discard its state and start over.
    pub fn forces_resync(self) -> bool {
        matches!(self, Self::InvalidSyncKey | Self::FolderHierarchyChanged)
    }
}

/// Conflict resolution requested by the client for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Client edits replace the server's copy.
    OverwriteServer,
    /// The server's copy wins; conflicting client edits are rejected.
    OverwritePim,
}

/// Item class of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionClass {
    /// Mail folder.
    Email,
    /// Address book.
    Contacts,
    /// Calendar.
    Calendar,
    /// Task list.
    Tasks,
    /// Notes.
    Notes,
    /// Text messages.
    Sms,
}

impl CollectionClass {
    /// Map a folder type number from the hierarchy to its item class.
    pub fn from_folder_type(folder_type: u8) -> Self {
        match folder_type {
            7 | 15 => Self::Tasks,
            8 | 13 => Self::Calendar,
            9 | 14 => Self::Contacts,
            10 | 17 => Self::Notes,
            _ => Self::Email,
        }
    }
}

impl fmt::Display for CollectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Email => "Email",
            Self::Contacts => "Contacts",
            Self::Calendar => "Calendar",
            Self::Tasks => "Tasks",
            Self::Notes => "Notes",
            Self::Sms => "SMS",
        };
        f.write_str(name)
    }
}

/// How far back in time a collection is synchronized.
///
/// Wraps the protocol's filter type number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterType(pub u8);

impl FilterType {
    /// No time restriction.
    pub const ALL: FilterType = FilterType(0);
    /// Only incomplete tasks.
    pub const INCOMPLETE_TASKS: FilterType = FilterType(8);

    /// Earliest Unix timestamp included by this filter, or 0 for no bound.
    pub fn cutoff(self, now: i64) -> i64 {
        const DAY: i64 = 86_400;
        let back = match self.0 {
            1 => DAY,
            2 => 3 * DAY,
            3 => 7 * DAY,
            4 => 14 * DAY,
            5 => 31 * DAY,
            6 => 93 * DAY,
            7 => 186 * DAY,
            _ => return 0,
        };
        now - back
    }
}

/// Remote-wipe status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RwStatus {
    /// Not provisioned for wipe.
    Na = 0,
    /// Provisioned, no wipe requested.
    Ok = 1,
    /// Wipe requested, not yet acknowledged.
    Pending = 2,
    /// Device confirmed the wipe.
    Wiped = 3,
}

impl RwStatus {
    /// Parse the stored numeric value.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Na),
            1 => Some(Self::Ok),
            2 => Some(Self::Pending),
            3 => Some(Self::Wiped),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_wire_values() {
        assert_eq!(SyncStatus::Success.code(), 1);
        assert_eq!(SyncStatus::InvalidSyncKey.code(), 3);
        assert_eq!(SyncStatus::Conflict.code(), 7);
        assert_eq!(SyncStatus::ObjectNotFound.code(), 8);
    }

    #[test]
    fn only_key_and_hierarchy_errors_force_resync() {
        assert!(SyncStatus::InvalidSyncKey.forces_resync());
        assert!(SyncStatus::FolderHierarchyChanged.forces_resync());
        assert!(!SyncStatus::Conflict.forces_resync());
        assert!(!SyncStatus::ServerError.forces_resync());
    }

    #[test]
    fn folder_types_map_to_classes() {
        assert_eq!(CollectionClass::from_folder_type(2), CollectionClass::Email);
        assert_eq!(CollectionClass::from_folder_type(8), CollectionClass::Calendar);
        assert_eq!(CollectionClass::from_folder_type(14), CollectionClass::Contacts);
        assert_eq!(CollectionClass::from_folder_type(15), CollectionClass::Tasks);
        assert_eq!(CollectionClass::from_folder_type(17), CollectionClass::Notes);
    }

    #[test]
    fn filter_cutoff() {
        let now = 1_000_000_000;
        assert_eq!(FilterType::ALL.cutoff(now), 0);
        assert_eq!(FilterType(1).cutoff(now), now - 86_400);
        assert_eq!(FilterType(5).cutoff(now), now - 31 * 86_400);
        assert_eq!(FilterType::INCOMPLETE_TASKS.cutoff(now), 0);
    }

    #[test]
    fn rw_status_roundtrip() {
        for status in [RwStatus::Na, RwStatus::Ok, RwStatus::Pending, RwStatus::Wiped] {
            assert_eq!(RwStatus::from_code(status as u8), Some(status));
        }
        assert_eq!(RwStatus::from_code(9), None);
    }
}
