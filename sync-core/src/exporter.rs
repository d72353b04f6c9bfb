//! Streams server-side changes to a wire encoder.
//!
//! The [`Exporter`] writes item changes for one collection in a single pass,
//! emitting each item at most once. Folder hierarchy changes are buffered
//! instead of streamed, since they are sent in a separate phase; the caller
//! looks at [`Exporter::count`] to decide whether that phase is needed.

use std::collections::HashSet;

use eas_sync_types::{CollectionId, FlagStatus, SyncMessage};

use crate::cache::FolderInfo;

/// Element names written by the exporter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    /// New item.
    Add,
    /// Modified item.
    Change,
    /// Removed item.
    Delete,
    /// Item identifier.
    ServerId,
    /// Item payload wrapper.
    ApplicationData,
    /// A named item property.
    Property(String),
    /// Category list wrapper.
    Categories,
    /// One category.
    Category,
    /// Read state.
    Read,
    /// Follow-up flag wrapper.
    Flag,
    /// Follow-up flag status.
    FlagStatus,
}

/// Append-only tag stream.
///
/// Calls arrive in strict nesting order: every `start_tag` is closed by a
/// matching `end_tag` after any content and children.
pub trait Encoder {
    /// Open an element.
    fn start_tag(&mut self, tag: Tag);

    /// Write text content into the open element.
    fn content(&mut self, text: &str);

    /// Close the most recently opened element.
    fn end_tag(&mut self);
}

/// One call recorded by [`RecordingEncoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `start_tag`
    Start(Tag),
    /// `content`
    Content(String),
    /// `end_tag`
    End,
}

/// In-memory encoder that records every call.
#[derive(Debug, Default, Clone)]
pub struct RecordingEncoder {
    tokens: Vec<Token>,
    depth: usize,
}

impl RecordingEncoder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded calls, in order.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Number of elements still open.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Encoder for RecordingEncoder {
    fn start_tag(&mut self, tag: Tag) {
        self.depth += 1;
        self.tokens.push(Token::Start(tag));
    }

    fn content(&mut self, text: &str) {
        self.tokens.push(Token::Content(text.to_string()));
    }

    fn end_tag(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.tokens.push(Token::End);
    }
}

/// A folder hierarchy change waiting for the hierarchy phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderChange {
    /// Folder UID.
    pub id: CollectionId,
    /// New folder data.
    pub folder: FolderInfo,
}

/// Writes one export pass to an encoder.
pub struct Exporter<E: Encoder> {
    encoder: E,
    seen: HashSet<String>,
    exported: usize,
    changed: Vec<FolderChange>,
    deleted: Vec<CollectionId>,
    count: usize,
}

impl<E: Encoder> Exporter<E> {
    /// Start a pass writing to `encoder`.
    pub fn new(encoder: E) -> Self {
        Self {
            encoder,
            seen: HashSet::new(),
            exported: 0,
            changed: Vec::new(),
            deleted: Vec::new(),
            count: 0,
        }
    }

    /// Record `id` as sent; false when it already was.
    fn first_sighting(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.exported += 1;
        true
    }

    fn element(&mut self, tag: Tag, text: &str) {
        self.encoder.start_tag(tag);
        self.encoder.content(text);
        self.encoder.end_tag();
    }

    /// Export an added or modified item.
    ///
    /// `is_new` selects between an add and a change. Returns false when the
    /// item was already exported in this pass.
    pub fn message_change(&mut self, id: &str, message: &SyncMessage, is_new: bool) -> bool {
        if !self.first_sighting(id) {
            return false;
        }

        self.encoder
            .start_tag(if is_new { Tag::Add } else { Tag::Change });
        self.element(Tag::ServerId, id);

        self.encoder.start_tag(Tag::ApplicationData);
        for (name, value) in &message.properties {
            self.element(Tag::Property(name.clone()), value);
        }
        if !message.categories.is_empty() {
            self.encoder.start_tag(Tag::Categories);
            for category in &message.categories {
                self.element(Tag::Category, category);
            }
            self.encoder.end_tag();
        }
        if let Some(read) = message.flags.read {
            self.element(Tag::Read, if read { "1" } else { "0" });
        }
        if let Some(status) = message.flags.flagged {
            self.write_flag(status);
        }
        self.encoder.end_tag();

        self.encoder.end_tag();
        true
    }

    /// Export a removal.
    pub fn message_deletion(&mut self, id: &str) -> bool {
        if !self.first_sighting(id) {
            return false;
        }
        self.encoder.start_tag(Tag::Delete);
        self.element(Tag::ServerId, id);
        self.encoder.end_tag();
        true
    }

    /// Export a read-state change.
    pub fn message_read_flag(&mut self, id: &str, read: bool) -> bool {
        if !self.first_sighting(id) {
            return false;
        }
        self.encoder.start_tag(Tag::Change);
        self.element(Tag::ServerId, id);
        self.encoder.start_tag(Tag::ApplicationData);
        self.element(Tag::Read, if read { "1" } else { "0" });
        self.encoder.end_tag();
        self.encoder.end_tag();
        true
    }

    /// Export a follow-up flag change.
    pub fn message_flag(&mut self, id: &str, status: FlagStatus) -> bool {
        if !self.first_sighting(id) {
            return false;
        }
        self.encoder.start_tag(Tag::Change);
        self.element(Tag::ServerId, id);
        self.encoder.start_tag(Tag::ApplicationData);
        self.write_flag(status);
        self.encoder.end_tag();
        self.encoder.end_tag();
        true
    }

    fn write_flag(&mut self, status: FlagStatus) {
        self.encoder.start_tag(Tag::Flag);
        if status != FlagStatus::Clear {
            let code = match status {
                FlagStatus::Complete => "1",
                _ => "2",
            };
            self.element(Tag::FlagStatus, code);
        }
        self.encoder.end_tag();
    }

    /// Buffer a folder addition or rename.
    pub fn folder_change(&mut self, id: CollectionId, folder: FolderInfo) {
        self.changed.push(FolderChange { id, folder });
        self.count += 1;
    }

    /// Buffer a folder removal.
    pub fn folder_deletion(&mut self, id: CollectionId) {
        self.deleted.push(id);
        self.count += 1;
    }

    /// Buffered folder changes.
    pub fn changed_folders(&self) -> &[FolderChange] {
        &self.changed
    }

    /// Buffered folder removals.
    pub fn deleted_folders(&self) -> &[CollectionId] {
        &self.deleted
    }

    /// Number of buffered folder hierarchy changes.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of distinct items streamed in this pass.
    pub fn exported(&self) -> usize {
        self.exported
    }

    /// Finish the pass and hand back the encoder.
    pub fn into_encoder(self) -> E {
        self.encoder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eas_sync_types::FlagChange;

    fn message() -> SyncMessage {
        SyncMessage {
            categories: vec!["Work".into()],
            flags: FlagChange::read(true),
            ..Default::default()
        }
        .with("Subject", "Hello")
    }

    #[test]
    fn add_and_change_are_chosen_by_new_flag() {
        let mut exporter = Exporter::new(RecordingEncoder::new());
        exporter.message_change("1", &message(), true);
        exporter.message_change("2", &message(), false);

        let enc = exporter.into_encoder();
        let starts: Vec<_> = enc
            .tokens()
            .iter()
            .filter(|t| matches!(t, Token::Start(Tag::Add | Tag::Change)))
            .collect();
        assert_eq!(
            starts,
            vec![&Token::Start(Tag::Add), &Token::Start(Tag::Change)]
        );
    }

    #[test]
    fn each_id_is_exported_once_per_pass() {
        let mut exporter = Exporter::new(RecordingEncoder::new());
        assert!(exporter.message_change("1", &message(), true));
        assert!(!exporter.message_change("1", &message(), false));
        assert!(!exporter.message_deletion("1"));
        assert!(!exporter.message_read_flag("1", false));
        assert!(exporter.message_deletion("2"));
        assert_eq!(exporter.exported(), 2);
    }

    #[test]
    fn output_is_strictly_nested() {
        let mut exporter = Exporter::new(RecordingEncoder::new());
        exporter.message_change("1", &message(), true);
        exporter.message_flag("2", FlagStatus::Active);
        exporter.message_deletion("3");

        let enc = exporter.into_encoder();
        assert_eq!(enc.depth(), 0);

        let mut depth = 0i32;
        for token in enc.tokens() {
            match token {
                Token::Start(_) => depth += 1,
                Token::End => depth -= 1,
                Token::Content(_) => assert!(depth > 0),
            }
            assert!(depth >= 0);
        }
        assert_eq!(depth, 0);
    }

    #[test]
    fn deletion_is_minimal() {
        let mut exporter = Exporter::new(RecordingEncoder::new());
        exporter.message_deletion("9");
        let enc = exporter.into_encoder();
        assert_eq!(
            enc.tokens(),
            &[
                Token::Start(Tag::Delete),
                Token::Start(Tag::ServerId),
                Token::Content("9".into()),
                Token::End,
                Token::End,
            ]
        );
    }

    #[test]
    fn cleared_flag_is_an_empty_element() {
        let mut exporter = Exporter::new(RecordingEncoder::new());
        exporter.message_flag("4", FlagStatus::Clear);
        let enc = exporter.into_encoder();
        assert!(!enc.tokens().contains(&Token::Start(Tag::FlagStatus)));
        assert!(enc.tokens().contains(&Token::Start(Tag::Flag)));
    }

    #[test]
    fn folder_changes_are_buffered_not_streamed() {
        let mut exporter = Exporter::new(RecordingEncoder::new());
        exporter.folder_change("f1".into(), FolderInfo::new("Archive", None, "Archive", 12));
        exporter.folder_deletion("f2".into());

        assert_eq!(exporter.count(), 2);
        assert_eq!(exporter.changed_folders().len(), 1);
        assert_eq!(exporter.deleted_folders(), &[CollectionId::from("f2")]);
        assert!(exporter.into_encoder().tokens().is_empty());
    }
}
