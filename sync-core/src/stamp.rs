//! Folder snapshots and change detection.
//!
//! A [`Stamp`] describes the content of a folder at one point in time:
//! - A validity counter; any change invalidates every earlier snapshot
//! - The highest sequence number assigned so far
//! - The revision marker of every item
//!
//! Comparing two stamps yields the delta between them without re-fetching
//! every item from the backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of a folder's contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    /// Validity counter. A change means ids from older stamps are meaningless.
    pub validity: u64,
    /// Highest sequence number assigned in the folder.
    pub highest_seq: u64,
    /// Item id to revision marker.
    pub items: BTreeMap<String, u64>,
}

/// Difference between two stamps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StampDelta {
    /// Ids present now but not in the baseline.
    pub added: Vec<String>,
    /// Ids present in both whose revision moved past the baseline.
    pub modified: Vec<String>,
    /// Ids present in the baseline but gone now.
    pub deleted: Vec<String>,
}

impl StampDelta {
    /// Total number of changes.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// Check if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Stamp {
    /// Create an empty stamp with the given validity counter.
    pub fn new(validity: u64) -> Self {
        Self {
            validity,
            highest_seq: 0,
            items: BTreeMap::new(),
        }
    }

    /// Record an item, bumping the highest sequence if needed.
    pub fn insert(&mut self, id: impl Into<String>, revision: u64) {
        self.highest_seq = self.highest_seq.max(revision);
        self.items.insert(id.into(), revision);
    }

    /// Record the revision a client has seen for an item.
    ///
    /// Leaves the highest sequence untouched, so server changes assigned
    /// lower sequence numbers in the meantime are still detected.
    pub fn observe(&mut self, id: impl Into<String>, revision: u64) {
        self.items.insert(id.into(), revision);
    }

    /// Forget an item.
    pub fn remove(&mut self, id: &str) -> Option<u64> {
        self.items.remove(id)
    }

    /// Revision of an item, if the snapshot contains it.
    pub fn revision_of(&self, id: &str) -> Option<u64> {
        self.items.get(id).copied()
    }

    /// Check whether `baseline` can no longer be diffed against this stamp.
    pub fn is_reset(&self, baseline: &Stamp) -> bool {
        self.validity != baseline.validity
    }

    /// Compute what changed since `baseline`.
    ///
    /// On reset every current id is reported as added and the baseline's ids
    /// as deleted, forcing a full re-fetch.
    pub fn get_changes(&self, baseline: &Stamp) -> StampDelta {
        if self.is_reset(baseline) {
            return StampDelta {
                added: self.items.keys().cloned().collect(),
                modified: Vec::new(),
                deleted: baseline.items.keys().cloned().collect(),
            };
        }

        // Nothing was assigned a new sequence and nothing disappeared.
        if self.highest_seq == baseline.highest_seq && self.items == baseline.items {
            return StampDelta::default();
        }

        let mut delta = StampDelta::default();

        for (id, &revision) in &self.items {
            match baseline.items.get(id) {
                None => delta.added.push(id.clone()),
                Some(_) if revision > baseline.highest_seq => delta.modified.push(id.clone()),
                Some(_) => {}
            }
        }

        delta.deleted = baseline
            .items
            .keys()
            .filter(|id| !self.items.contains_key(*id))
            .cloned()
            .collect();

        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(validity: u64, items: &[(&str, u64)]) -> Stamp {
        let mut s = Stamp::new(validity);
        for (id, rev) in items {
            s.insert(*id, *rev);
        }
        s
    }

    #[test]
    fn identical_stamps_have_no_changes() {
        let a = stamp(1, &[("1", 1), ("2", 2)]);
        assert!(a.get_changes(&a.clone()).is_empty());
    }

    #[test]
    fn validity_change_is_reset() {
        let old = stamp(1, &[("1", 1)]);
        let new = stamp(2, &[("1", 1), ("2", 2)]);

        assert!(new.is_reset(&old));
        let delta = new.get_changes(&old);
        assert_eq!(delta.added, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(delta.deleted, vec!["1".to_string()]);
    }

    #[test]
    fn added_and_deleted_ids_are_reported() {
        let old = stamp(1, &[("1", 1), ("2", 2)]);
        let new = stamp(1, &[("2", 2), ("3", 3)]);

        let delta = new.get_changes(&old);
        assert_eq!(delta.added, vec!["3".to_string()]);
        assert_eq!(delta.deleted, vec!["1".to_string()]);
        assert!(delta.modified.is_empty());
    }

    #[test]
    fn modification_requires_strictly_greater_revision() {
        let old = stamp(1, &[("1", 1), ("2", 5)]);
        let mut new = old.clone();
        new.insert("1", 6);
        // Equal to the baseline's highest sequence: not a modification.
        new.items.insert("2".into(), 5);

        let delta = new.get_changes(&old);
        assert_eq!(delta.modified, vec!["1".to_string()]);
        assert_eq!(delta.len(), 1);
    }

    #[test]
    fn observe_does_not_hide_lower_server_changes() {
        let baseline = stamp(1, &[("x", 9), ("y", 10)]);
        let mut observed = baseline.clone();
        observed.observe("y", 12);
        assert_eq!(observed.highest_seq, 10);

        let mut current = baseline.clone();
        current.insert("x", 11);
        current.insert("y", 12);

        let delta = current.get_changes(&observed);
        assert_eq!(delta.modified, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn revision_lookup() {
        let s = stamp(1, &[("42", 9)]);
        assert_eq!(s.revision_of("42"), Some(9));
        assert_eq!(s.revision_of("43"), None);
        assert_eq!(s.highest_seq, 9);
    }
}
