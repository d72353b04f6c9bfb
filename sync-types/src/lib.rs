//! # sync-types
//!
//! Foundational types for the ActiveSync sync-state core.
//!
//! This crate provides the types shared by every other crate in the workspace:
//! - [`DeviceId`], [`UserId`], [`CollectionId`], [`SyncKey`] - Identity and checkpoint types
//! - [`ChangeRecord`], [`ChangePayload`], [`ChangeType`] - The typed change log entry
//! - [`SyncMessage`], [`MessageStat`], [`FlagChange`] - Backend item payloads
//! - [`SyncStatus`], [`ConflictPolicy`], [`CollectionClass`], [`FilterType`] - Protocol enums
//! - [`SyncError`] - Error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod change;
mod error;
mod ids;
mod status;

pub use change::{
    ChangeOrigin, ChangePayload, ChangeRecord, ChangeType, FlagChange, FlagStatus, MessageStat,
    SyncMessage,
};
pub use error::SyncError;
pub use ids::{CollectionId, DeviceId, SyncKey, UserId};
pub use status::{CollectionClass, ConflictPolicy, FilterType, RwStatus, SyncStatus};

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current Unix time in milliseconds.
pub fn unix_now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
