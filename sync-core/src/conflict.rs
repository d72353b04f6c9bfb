//! Conflict rule for client operations.
//!
//! A client edit conflicts when the server's copy of the item is no longer
//! the copy the client last saw. The rule depends on the kind of operation:
//!
//! | Server state      | Client CHANGE | Client DELETE | Flags / Move |
//! |-------------------|---------------|---------------|--------------|
//! | unchanged         | no            | no            | no           |
//! | changed           | yes           | yes           | no           |
//! | gone              | yes           | no            | no           |

use eas_sync_types::{ChangeType, MessageStat};

use crate::Stamp;

/// Decide whether a client operation conflicts with the server's copy.
///
/// `observed` is the snapshot recorded the last time this device saw the
/// collection; `stat` is the backend's current view of the item, `None` when
/// the item no longer exists.
pub fn is_conflict(observed: &Stamp, stat: Option<&MessageStat>, change: ChangeType) -> bool {
    let Some(stat) = stat else {
        return change == ChangeType::Change;
    };

    match change {
        ChangeType::Change | ChangeType::Delete => match observed.revision_of(&stat.id) {
            Some(seen) => stat.revision != seen,
            // Never shown to this device: only newer than the snapshot counts.
            None => stat.revision > observed.highest_seq,
        },
        ChangeType::Flags | ChangeType::Move => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eas_sync_types::FlagChange;

    fn stat(id: &str, revision: u64) -> MessageStat {
        MessageStat {
            id: id.into(),
            revision,
            flags: FlagChange::default(),
        }
    }

    fn observed() -> Stamp {
        let mut s = Stamp::new(1);
        s.insert("42", 5);
        s.insert("43", 7);
        s
    }

    #[test]
    fn vanished_item_conflicts_only_with_change() {
        let s = observed();
        assert!(is_conflict(&s, None, ChangeType::Change));
        assert!(!is_conflict(&s, None, ChangeType::Delete));
        assert!(!is_conflict(&s, None, ChangeType::Flags));
    }

    #[test]
    fn unchanged_item_never_conflicts() {
        let s = observed();
        let st = stat("42", 5);
        assert!(!is_conflict(&s, Some(&st), ChangeType::Change));
        assert!(!is_conflict(&s, Some(&st), ChangeType::Delete));
    }

    #[test]
    fn changed_item_conflicts_with_change_and_delete() {
        let s = observed();
        let st = stat("42", 9);
        assert!(is_conflict(&s, Some(&st), ChangeType::Change));
        assert!(is_conflict(&s, Some(&st), ChangeType::Delete));
    }

    #[test]
    fn flag_and_move_are_never_conflicts() {
        let s = observed();
        let st = stat("42", 9);
        assert!(!is_conflict(&s, Some(&st), ChangeType::Flags));
        assert!(!is_conflict(&s, Some(&st), ChangeType::Move));
    }

    #[test]
    fn unseen_item_conflicts_when_newer_than_snapshot() {
        let s = observed();
        assert!(!is_conflict(&s, Some(&stat("99", 6)), ChangeType::Change));
        assert!(is_conflict(&s, Some(&stat("99", 8)), ChangeType::Change));
    }
}
