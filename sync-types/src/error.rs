//! Error taxonomy for the sync-state core.

use thiserror::Error;

use crate::SyncStatus;

/// Errors that can occur while synchronizing a collection.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Client and server both changed the item.
    #[error("conflict on item {id}")]
    Conflict {
        /// The conflicting item.
        id: String,
    },

    /// Referenced item no longer exists.
    #[error("item not found: {id}")]
    NotFound {
        /// The missing item.
        id: String,
    },

    /// Backend call failed.
    #[error("server error: {0}")]
    Server(String),

    /// Another request saved a newer sync cache.
    #[error("sync cache is stale")]
    StaleCache,

    /// Another request advanced this collection's sync key first.
    #[error("sync state for {collection} was advanced concurrently")]
    StaleState {
        /// The collection whose key moved underneath us.
        collection: String,
    },

    /// Client presented state that contradicts what the server recorded.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Sync key is malformed or unknown.
    #[error("invalid sync key: {0}")]
    InvalidSyncKey(String),

    /// Operation not implemented by this backend.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// MessagePack serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed.
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),
}

impl SyncError {
    /// Status reported to the client for this error.
    pub fn status(&self) -> SyncStatus {
        match self {
            Self::Conflict { .. } => SyncStatus::Conflict,
            Self::NotFound { .. } => SyncStatus::ObjectNotFound,
            Self::StaleState { .. }
            | Self::ProtocolViolation(_)
            | Self::InvalidSyncKey(_) => SyncStatus::InvalidSyncKey,
            Self::StaleCache
            | Self::Server(_)
            | Self::Unsupported(_)
            | Self::Serialization(_)
            | Self::Deserialization(_) => SyncStatus::ServerError,
        }
    }

    /// Whether recovery means discarding client state and resyncing.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            Self::StaleState { .. } | Self::ProtocolViolation(_) | Self::InvalidSyncKey(_)
        )
    }
}
