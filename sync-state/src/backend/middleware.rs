//! Driver middleware.
//!
//! Each layer wraps a [`Driver`] in another `Driver`, so stages stack with
//! [`tower::ServiceBuilder`] and the core never knows they are there.

use super::{Driver, DriverError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tower::Layer;
use tracing::{debug, warn};

use eas_sync_core::Stamp;
use eas_sync_types::{FlagStatus, MessageStat, SyncMessage};

/// Logs every driver call and its outcome at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLayer;

impl<D> Layer<D> for LogLayer {
    type Service = LogDriver<D>;

    fn layer(&self, inner: D) -> Self::Service {
        LogDriver { inner }
    }
}

/// Driver wrapped by [`LogLayer`].
#[derive(Debug, Clone)]
pub struct LogDriver<D> {
    inner: D,
}

impl<D> LogDriver<D> {
    /// The wrapped driver.
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

async fn logged<T, F>(op: &'static str, folder: &str, fut: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    let result = fut.await;
    match &result {
        Ok(_) => debug!(op, folder, "driver call succeeded"),
        Err(e) => debug!(op, folder, error = %e, "driver call failed"),
    }
    result
}

#[async_trait]
impl<D: Driver> Driver for LogDriver<D> {
    async fn stat(&self, folder: &str, id: &str) -> Result<Option<MessageStat>, DriverError> {
        logged("stat", folder, self.inner.stat(folder, id)).await
    }

    async fn fetch(
        &self,
        folder: &str,
        ids: &[String],
    ) -> Result<Vec<(String, SyncMessage)>, DriverError> {
        logged("fetch", folder, self.inner.fetch(folder, ids)).await
    }

    async fn change_message(
        &self,
        folder: &str,
        id: Option<&str>,
        message: &SyncMessage,
    ) -> Result<MessageStat, DriverError> {
        logged(
            "change_message",
            folder,
            self.inner.change_message(folder, id, message),
        )
        .await
    }

    async fn delete_message(
        &self,
        folder: &str,
        ids: &[String],
    ) -> Result<Vec<String>, DriverError> {
        logged("delete_message", folder, self.inner.delete_message(folder, ids)).await
    }

    async fn move_messages(
        &self,
        folder: &str,
        ids: &[String],
        destination: &str,
    ) -> Result<BTreeMap<String, String>, DriverError> {
        logged(
            "move_messages",
            folder,
            self.inner.move_messages(folder, ids, destination),
        )
        .await
    }

    async fn set_read_flag(
        &self,
        folder: &str,
        id: &str,
        read: bool,
    ) -> Result<MessageStat, DriverError> {
        logged("set_read_flag", folder, self.inner.set_read_flag(folder, id, read)).await
    }

    async fn set_flag(
        &self,
        folder: &str,
        id: &str,
        status: FlagStatus,
    ) -> Result<MessageStat, DriverError> {
        logged("set_flag", folder, self.inner.set_flag(folder, id, status)).await
    }

    async fn get_sync_stamp(&self, folder: &str) -> Result<Stamp, DriverError> {
        logged("get_sync_stamp", folder, self.inner.get_sync_stamp(folder)).await
    }

    async fn get_uids(&self, folder: &str) -> Result<Vec<String>, DriverError> {
        logged("get_uids", folder, self.inner.get_uids(folder)).await
    }
}

/// Warns about driver calls slower than a threshold.
#[derive(Debug, Clone, Copy)]
pub struct TimerLayer {
    threshold: Duration,
}

impl TimerLayer {
    /// Warn when a call takes longer than `threshold`.
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }
}

impl<D> Layer<D> for TimerLayer {
    type Service = TimerDriver<D>;

    fn layer(&self, inner: D) -> Self::Service {
        TimerDriver {
            inner,
            threshold: self.threshold,
        }
    }
}

/// Driver wrapped by [`TimerLayer`].
#[derive(Debug, Clone)]
pub struct TimerDriver<D> {
    inner: D,
    threshold: Duration,
}

impl<D> TimerDriver<D> {
    /// The wrapped driver.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T, DriverError>
    where
        F: Future<Output = Result<T, DriverError>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();
        if elapsed > self.threshold {
            warn!(op, elapsed_ms = elapsed.as_millis() as u64, "slow driver call");
        }
        result
    }
}

#[async_trait]
impl<D: Driver> Driver for TimerDriver<D> {
    async fn stat(&self, folder: &str, id: &str) -> Result<Option<MessageStat>, DriverError> {
        self.timed("stat", self.inner.stat(folder, id)).await
    }

    async fn fetch(
        &self,
        folder: &str,
        ids: &[String],
    ) -> Result<Vec<(String, SyncMessage)>, DriverError> {
        self.timed("fetch", self.inner.fetch(folder, ids)).await
    }

    async fn change_message(
        &self,
        folder: &str,
        id: Option<&str>,
        message: &SyncMessage,
    ) -> Result<MessageStat, DriverError> {
        self.timed(
            "change_message",
            self.inner.change_message(folder, id, message),
        )
        .await
    }

    async fn delete_message(
        &self,
        folder: &str,
        ids: &[String],
    ) -> Result<Vec<String>, DriverError> {
        self.timed("delete_message", self.inner.delete_message(folder, ids))
            .await
    }

    async fn move_messages(
        &self,
        folder: &str,
        ids: &[String],
        destination: &str,
    ) -> Result<BTreeMap<String, String>, DriverError> {
        self.timed(
            "move_messages",
            self.inner.move_messages(folder, ids, destination),
        )
        .await
    }

    async fn set_read_flag(
        &self,
        folder: &str,
        id: &str,
        read: bool,
    ) -> Result<MessageStat, DriverError> {
        self.timed("set_read_flag", self.inner.set_read_flag(folder, id, read))
            .await
    }

    async fn set_flag(
        &self,
        folder: &str,
        id: &str,
        status: FlagStatus,
    ) -> Result<MessageStat, DriverError> {
        self.timed("set_flag", self.inner.set_flag(folder, id, status))
            .await
    }

    async fn get_sync_stamp(&self, folder: &str) -> Result<Stamp, DriverError> {
        self.timed("get_sync_stamp", self.inner.get_sync_stamp(folder))
            .await
    }

    async fn get_uids(&self, folder: &str) -> Result<Vec<String>, DriverError> {
        self.timed("get_uids", self.inner.get_uids(folder)).await
    }
}
