//! Error types for sync-state.

use std::path::PathBuf;

use eas_sync_types::{SyncError, SyncStatus};

use crate::backend::DriverError;

/// Main error type for sync-state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Backend driver error.
    #[error("backend error: {0}")]
    Driver(#[from] DriverError),

    /// Sync protocol error.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl StateError {
    /// Status reported to the client for this error.
    pub fn status(&self) -> SyncStatus {
        match self {
            Self::Sync(e) => e.status(),
            Self::Driver(e) => e.status(),
            Self::Config(_) | Self::Storage(_) => SyncStatus::ServerError,
        }
    }

    /// Whether the client must restart from the initial sync key.
    pub fn requires_resync(&self) -> bool {
        matches!(self, Self::Sync(e) if e.requires_resync())
    }
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored row not found.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing row.
        what: String,
    },

    /// Stored blob could not be encoded.
    #[error("encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Stored blob could not be decoded.
    #[error("decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Result type alias for sync-state operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_errors_keep_their_status() {
        let err: StateError = SyncError::InvalidSyncKey("x".into()).into();
        assert_eq!(err.status(), SyncStatus::InvalidSyncKey);
        assert!(err.requires_resync());
    }

    #[test]
    fn storage_errors_are_server_errors() {
        let err: StateError = StorageError::NotFound {
            what: "device".into(),
        }
        .into();
        assert_eq!(err.status(), SyncStatus::ServerError);
        assert!(!err.requires_resync());
        assert_eq!(err.to_string(), "storage error: not found: device");
    }
}
