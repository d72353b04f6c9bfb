//! Backend item store abstraction.
//!
//! The [`Driver`] trait is the only way the sync-state core reads or changes
//! backend data. Implementations map it onto a mail store, calendar, address
//! book or the in-memory [`MockDriver`].
//!
//! # Middleware
//!
//! Cross-cutting behavior wraps a driver as [`tower::Layer`]s composed at
//! construction time:
//!
//! ```ignore
//! let driver = tower::ServiceBuilder::new()
//!     .layer(LogLayer)
//!     .layer(TimerLayer::new(Duration::from_millis(500)))
//!     .service(MockDriver::new());
//! ```

mod middleware;
mod mock;

pub use middleware::{LogDriver, LogLayer, TimerDriver, TimerLayer};
pub use mock::MockDriver;

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

use eas_sync_core::Stamp;
use eas_sync_types::{FlagStatus, MessageStat, SyncMessage, SyncStatus};

/// Backend driver errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// The item or folder does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend does not implement this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The backend rejected the item.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// The backend failed.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl DriverError {
    /// Status reported to the client for this error.
    pub fn status(&self) -> SyncStatus {
        match self {
            Self::NotFound(_) => SyncStatus::ObjectNotFound,
            Self::Conversion(_) => SyncStatus::ConversionError,
            Self::Unsupported(_) | Self::Backend(_) => SyncStatus::ServerError,
        }
    }

    /// Check whether the operation is simply not available.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

/// Backend item store.
///
/// Folders are addressed by their backend server id.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Current state of an item, or `None` when it does not exist.
    async fn stat(&self, folder: &str, id: &str) -> Result<Option<MessageStat>, DriverError>;

    /// Load items. Missing ids are left out of the result.
    async fn fetch(
        &self,
        folder: &str,
        ids: &[String],
    ) -> Result<Vec<(String, SyncMessage)>, DriverError>;

    /// Create (`id` = `None`) or replace an item; returns its new state.
    async fn change_message(
        &self,
        folder: &str,
        id: Option<&str>,
        message: &SyncMessage,
    ) -> Result<MessageStat, DriverError>;

    /// Remove items; returns the ids actually removed.
    async fn delete_message(&self, folder: &str, ids: &[String])
        -> Result<Vec<String>, DriverError>;

    /// Move items; returns old id to new id for every item moved.
    async fn move_messages(
        &self,
        folder: &str,
        ids: &[String],
        destination: &str,
    ) -> Result<BTreeMap<String, String>, DriverError>;

    /// Change the read state of an item.
    async fn set_read_flag(
        &self,
        folder: &str,
        id: &str,
        read: bool,
    ) -> Result<MessageStat, DriverError>;

    /// Change the follow-up flag of an item.
    async fn set_flag(
        &self,
        _folder: &str,
        _id: &str,
        _status: FlagStatus,
    ) -> Result<MessageStat, DriverError> {
        Err(DriverError::Unsupported("set_flag"))
    }

    /// Snapshot of a folder.
    async fn get_sync_stamp(&self, folder: &str) -> Result<Stamp, DriverError>;

    /// Every item id of a folder.
    async fn get_uids(&self, folder: &str) -> Result<Vec<String>, DriverError>;
}

#[async_trait]
impl<D: Driver + ?Sized> Driver for std::sync::Arc<D> {
    async fn stat(&self, folder: &str, id: &str) -> Result<Option<MessageStat>, DriverError> {
        (**self).stat(folder, id).await
    }

    async fn fetch(
        &self,
        folder: &str,
        ids: &[String],
    ) -> Result<Vec<(String, SyncMessage)>, DriverError> {
        (**self).fetch(folder, ids).await
    }

    async fn change_message(
        &self,
        folder: &str,
        id: Option<&str>,
        message: &SyncMessage,
    ) -> Result<MessageStat, DriverError> {
        (**self).change_message(folder, id, message).await
    }

    async fn delete_message(
        &self,
        folder: &str,
        ids: &[String],
    ) -> Result<Vec<String>, DriverError> {
        (**self).delete_message(folder, ids).await
    }

    async fn move_messages(
        &self,
        folder: &str,
        ids: &[String],
        destination: &str,
    ) -> Result<BTreeMap<String, String>, DriverError> {
        (**self).move_messages(folder, ids, destination).await
    }

    async fn set_read_flag(
        &self,
        folder: &str,
        id: &str,
        read: bool,
    ) -> Result<MessageStat, DriverError> {
        (**self).set_read_flag(folder, id, read).await
    }

    async fn set_flag(
        &self,
        folder: &str,
        id: &str,
        status: FlagStatus,
    ) -> Result<MessageStat, DriverError> {
        (**self).set_flag(folder, id, status).await
    }

    async fn get_sync_stamp(&self, folder: &str) -> Result<Stamp, DriverError> {
        (**self).get_sync_stamp(folder).await
    }

    async fn get_uids(&self, folder: &str) -> Result<Vec<String>, DriverError> {
        (**self).get_uids(folder).await
    }
}
