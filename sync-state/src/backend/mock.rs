//! Mock driver for testing.
//!
//! Keeps folders in memory and lets tests simulate server-side edits and
//! backend failures.

use super::{Driver, DriverError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use eas_sync_core::Stamp;
use eas_sync_types::{FlagStatus, MessageStat, SyncMessage};

#[derive(Debug, Default)]
struct MockFolder {
    validity: u64,
    next_seq: u64,
    next_uid: u64,
    items: BTreeMap<String, MockItem>,
}

#[derive(Debug, Clone)]
struct MockItem {
    revision: u64,
    message: SyncMessage,
}

impl MockFolder {
    fn new() -> Self {
        Self {
            validity: 1,
            ..Default::default()
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn new_uid(&mut self) -> String {
        loop {
            self.next_uid += 1;
            let id = self.next_uid.to_string();
            if !self.items.contains_key(&id) {
                return id;
            }
        }
    }

    fn stat(&self, id: &str) -> Option<MessageStat> {
        self.items.get(id).map(|item| MessageStat {
            id: id.to_string(),
            revision: item.revision,
            flags: item.message.flags.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct MockDriverInner {
    folders: HashMap<String, MockFolder>,
    fail_next: Option<DriverError>,
    created: usize,
    calls: Vec<&'static str>,
}

/// Mock driver for testing.
///
/// Clones share the same folders.
#[derive(Debug, Default)]
pub struct MockDriver {
    inner: Arc<Mutex<MockDriverInner>>,
}

impl MockDriver {
    /// Create an empty mock driver.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockDriverInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an empty folder.
    pub fn add_folder(&self, folder: &str) {
        self.lock()
            .folders
            .entry(folder.to_string())
            .or_insert_with(MockFolder::new);
    }

    /// Store an item as if it arrived on the server; returns its revision.
    pub fn add_message(&self, folder: &str, id: &str, message: SyncMessage) -> u64 {
        let mut inner = self.lock();
        let f = inner
            .folders
            .entry(folder.to_string())
            .or_insert_with(MockFolder::new);
        let revision = f.bump();
        f.items
            .insert(id.to_string(), MockItem { revision, message });
        revision
    }

    /// Modify an item on the server side; returns the new revision.
    pub fn touch(&self, folder: &str, id: &str) -> Option<u64> {
        let mut inner = self.lock();
        let f = inner.folders.get_mut(folder)?;
        let revision = f.bump();
        let item = f.items.get_mut(id)?;
        item.revision = revision;
        Some(revision)
    }

    /// Remove an item on the server side.
    pub fn remove(&self, folder: &str, id: &str) -> bool {
        let mut inner = self.lock();
        inner
            .folders
            .get_mut(folder)
            .and_then(|f| f.items.remove(id))
            .is_some()
    }

    /// Invalidate every snapshot of a folder.
    pub fn reset_validity(&self, folder: &str) {
        if let Some(f) = self.lock().folders.get_mut(folder) {
            f.validity += 1;
        }
    }

    /// Current copy of an item.
    pub fn message(&self, folder: &str, id: &str) -> Option<SyncMessage> {
        let inner = self.lock();
        inner
            .folders
            .get(folder)
            .and_then(|f| f.items.get(id))
            .map(|item| item.message.clone())
    }

    /// Number of items in a folder.
    pub fn item_count(&self, folder: &str) -> usize {
        self.lock()
            .folders
            .get(folder)
            .map_or(0, |f| f.items.len())
    }

    /// Number of items created through [`Driver::change_message`].
    pub fn created_count(&self) -> usize {
        self.lock().created
    }

    /// Names of the driver operations called so far.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    /// Cause the next driver call to fail with the given error.
    pub fn fail_next(&self, error: DriverError) {
        self.lock().fail_next = Some(error);
    }

    fn begin(&self, op: &'static str) -> Result<MutexGuard<'_, MockDriverInner>, DriverError> {
        let mut inner = self.lock();
        inner.calls.push(op);
        if let Some(error) = inner.fail_next.take() {
            return Err(error);
        }
        Ok(inner)
    }
}

impl Clone for MockDriver {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn folder_mut<'a>(
    inner: &'a mut MockDriverInner,
    folder: &str,
) -> Result<&'a mut MockFolder, DriverError> {
    inner
        .folders
        .get_mut(folder)
        .ok_or_else(|| DriverError::NotFound(folder.to_string()))
}

#[async_trait]
impl Driver for MockDriver {
    async fn stat(&self, folder: &str, id: &str) -> Result<Option<MessageStat>, DriverError> {
        let mut inner = self.begin("stat")?;
        Ok(folder_mut(&mut inner, folder)?.stat(id))
    }

    async fn fetch(
        &self,
        folder: &str,
        ids: &[String],
    ) -> Result<Vec<(String, SyncMessage)>, DriverError> {
        let mut inner = self.begin("fetch")?;
        let f = folder_mut(&mut inner, folder)?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                f.items
                    .get(id)
                    .map(|item| (id.clone(), item.message.clone()))
            })
            .collect())
    }

    async fn change_message(
        &self,
        folder: &str,
        id: Option<&str>,
        message: &SyncMessage,
    ) -> Result<MessageStat, DriverError> {
        let mut inner = self.begin("change_message")?;
        let f = folder_mut(&mut inner, folder)?;

        let (id, is_new) = match id {
            Some(id) if !f.items.contains_key(id) => {
                return Err(DriverError::NotFound(id.to_string()))
            }
            Some(id) => (id.to_string(), false),
            None => (f.new_uid(), true),
        };
        let revision = f.bump();
        f.items.insert(
            id.clone(),
            MockItem {
                revision,
                message: message.clone(),
            },
        );
        let stat = f.stat(&id);

        if is_new {
            inner.created += 1;
        }
        stat.ok_or(DriverError::NotFound(id))
    }

    async fn delete_message(
        &self,
        folder: &str,
        ids: &[String],
    ) -> Result<Vec<String>, DriverError> {
        let mut inner = self.begin("delete_message")?;
        let f = folder_mut(&mut inner, folder)?;
        let mut deleted = Vec::new();
        for id in ids {
            if f.items.remove(id).is_some() {
                deleted.push(id.clone());
            }
        }
        if !deleted.is_empty() {
            f.bump();
        }
        Ok(deleted)
    }

    async fn move_messages(
        &self,
        folder: &str,
        ids: &[String],
        destination: &str,
    ) -> Result<BTreeMap<String, String>, DriverError> {
        let mut inner = self.begin("move_messages")?;
        if !inner.folders.contains_key(destination) {
            return Err(DriverError::NotFound(destination.to_string()));
        }

        let mut moved = Vec::new();
        {
            let src = folder_mut(&mut inner, folder)?;
            for id in ids {
                if let Some(item) = src.items.remove(id) {
                    moved.push((id.clone(), item));
                }
            }
            if !moved.is_empty() {
                src.bump();
            }
        }

        let dst = folder_mut(&mut inner, destination)?;
        let mut results = BTreeMap::new();
        for (old_id, mut item) in moved {
            let new_id = dst.new_uid();
            item.revision = dst.bump();
            dst.items.insert(new_id.clone(), item);
            results.insert(old_id, new_id);
        }
        Ok(results)
    }

    async fn set_read_flag(
        &self,
        folder: &str,
        id: &str,
        read: bool,
    ) -> Result<MessageStat, DriverError> {
        let mut inner = self.begin("set_read_flag")?;
        let f = folder_mut(&mut inner, folder)?;
        let revision = f.bump();
        let item = f
            .items
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
        item.message.flags.read = Some(read);
        item.revision = revision;
        f.stat(id).ok_or_else(|| DriverError::NotFound(id.to_string()))
    }

    async fn set_flag(
        &self,
        folder: &str,
        id: &str,
        status: FlagStatus,
    ) -> Result<MessageStat, DriverError> {
        let mut inner = self.begin("set_flag")?;
        let f = folder_mut(&mut inner, folder)?;
        let revision = f.bump();
        let item = f
            .items
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
        item.message.flags.flagged = Some(status);
        item.revision = revision;
        f.stat(id).ok_or_else(|| DriverError::NotFound(id.to_string()))
    }

    async fn get_sync_stamp(&self, folder: &str) -> Result<Stamp, DriverError> {
        let mut inner = self.begin("get_sync_stamp")?;
        let f = folder_mut(&mut inner, folder)?;
        let mut stamp = Stamp::new(f.validity);
        for (id, item) in &f.items {
            stamp.insert(id.clone(), item.revision);
        }
        stamp.highest_seq = stamp.highest_seq.max(f.next_seq);
        Ok(stamp)
    }

    async fn get_uids(&self, folder: &str) -> Result<Vec<String>, DriverError> {
        let mut inner = self.begin("get_uids")?;
        Ok(folder_mut(&mut inner, folder)?.items.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(subject: &str) -> SyncMessage {
        SyncMessage::default().with("Subject", subject)
    }

    #[tokio::test]
    async fn stamp_tracks_server_edits() {
        let driver = MockDriver::new();
        driver.add_message("INBOX", "1", msg("a"));
        driver.add_message("INBOX", "2", msg("b"));

        let before = driver.get_sync_stamp("INBOX").await.unwrap();
        driver.touch("INBOX", "1");
        driver.remove("INBOX", "2");
        driver.add_message("INBOX", "3", msg("c"));
        let after = driver.get_sync_stamp("INBOX").await.unwrap();

        let delta = after.get_changes(&before);
        assert_eq!(delta.added, vec!["3".to_string()]);
        assert_eq!(delta.modified, vec!["1".to_string()]);
        assert_eq!(delta.deleted, vec!["2".to_string()]);
    }

    #[tokio::test]
    async fn change_message_creates_and_replaces() {
        let driver = MockDriver::new();
        driver.add_folder("INBOX");

        let created = driver
            .change_message("INBOX", None, &msg("new"))
            .await
            .unwrap();
        assert_eq!(driver.created_count(), 1);

        let replaced = driver
            .change_message("INBOX", Some(&created.id), &msg("edited"))
            .await
            .unwrap();
        assert!(replaced.revision > created.revision);
        assert_eq!(driver.created_count(), 1);
        assert_eq!(driver.item_count("INBOX"), 1);

        let missing = driver.change_message("INBOX", Some("nope"), &msg("x")).await;
        assert_eq!(missing, Err(DriverError::NotFound("nope".into())));
    }

    #[tokio::test]
    async fn move_reports_only_moved_ids() {
        let driver = MockDriver::new();
        driver.add_message("INBOX", "a", msg("a"));
        driver.add_folder("dest");

        let moved = driver
            .move_messages("INBOX", &["a".into(), "b".into()], "dest")
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert!(moved.contains_key("a"));
        assert_eq!(driver.item_count("dest"), 1);
    }

    #[tokio::test]
    async fn fail_next_applies_once() {
        let driver = MockDriver::new();
        driver.add_folder("INBOX");
        driver.fail_next(DriverError::Backend("down".into()));

        assert!(driver.get_uids("INBOX").await.is_err());
        assert!(driver.get_uids("INBOX").await.is_ok());
        assert_eq!(driver.calls(), vec!["get_uids", "get_uids"]);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let driver = MockDriver::new();
        let clone = driver.clone();
        clone.add_message("INBOX", "1", msg("a"));
        assert_eq!(driver.item_count("INBOX"), 1);
    }
}
