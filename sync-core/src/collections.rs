//! Phase machine for one protocol exchange's collection working set.
//!
//! This module provides the pure part of the Collections handler: the phase
//! the working set is in and the rule deciding whether a client-supplied
//! collection differs from what the cache remembers. The handler that owns
//! the working set and talks to storage lives in the state crate.

use crate::cache::CollectionState;

/// Where a collection working set is within one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectionsPhase {
    /// Nothing loaded yet.
    #[default]
    Empty,
    /// Working set populated from the sync cache.
    LoadedFromCache,
    /// At least one client-supplied collection merged in.
    MergedWithClient,
    /// A partial sync of the working set can proceed.
    PartialSyncReady,
    /// The client must describe every collection again.
    FullSyncRequired,
}

/// Input to [`CollectionsPhase::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Collections were loaded from the cache.
    CacheLoaded,
    /// The client supplied a collection.
    ClientCollectionAdded,
    /// Partial sync was evaluated.
    PartialSyncEvaluated {
        /// Whether a partial sync is possible.
        ready: bool,
    },
    /// Working set discarded.
    Reset,
}

impl CollectionsPhase {
    /// Apply an event and return the next phase.
    ///
    /// Events that do not apply to the current phase leave it unchanged.
    pub fn on_event(self, event: PhaseEvent) -> Self {
        match (self, event) {
            (_, PhaseEvent::Reset) => Self::Empty,

            (Self::Empty, PhaseEvent::CacheLoaded) => Self::LoadedFromCache,
            // Reloading after a refresh keeps whatever the client added.
            (phase, PhaseEvent::CacheLoaded) => phase,

            (
                Self::Empty | Self::LoadedFromCache | Self::MergedWithClient,
                PhaseEvent::ClientCollectionAdded,
            ) => Self::MergedWithClient,

            (
                Self::Empty | Self::LoadedFromCache | Self::MergedWithClient,
                PhaseEvent::PartialSyncEvaluated { ready },
            ) => {
                if ready {
                    Self::PartialSyncReady
                } else {
                    Self::FullSyncRequired
                }
            }

            (phase, _) => phase,
        }
    }

    /// Check whether the working set was merged with client data.
    pub fn has_client_data(self) -> bool {
        matches!(self, Self::MergedWithClient | Self::PartialSyncReady)
    }

    /// Check whether a decision about partial sync has been made.
    pub fn is_decided(self) -> bool {
        matches!(self, Self::PartialSyncReady | Self::FullSyncRequired)
    }
}

/// Check whether a client-supplied collection changes what the cache holds.
///
/// Only fields the client actually sent are compared. A change to the filter
/// type, body preferences, MIME support, conflict policy, deletes-as-moves or
/// sync key counts; so does a collection the cache has never seen.
pub fn materially_differs(client: &CollectionState, cached: Option<&CollectionState>) -> bool {
    let Some(cached) = cached else {
        return true;
    };

    fn changed<T: PartialEq>(sent: &Option<T>, known: &Option<T>) -> bool {
        sent.is_some() && sent != known
    }

    changed(&client.filter_type, &cached.filter_type)
        || changed(&client.body_prefs, &cached.body_prefs)
        || changed(&client.mime_support, &cached.mime_support)
        || changed(&client.conflict, &cached.conflict)
        || changed(&client.deletes_as_moves, &cached.deletes_as_moves)
        || changed(&client.sync_key, &cached.sync_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eas_sync_types::{FilterType, SyncKey};

    #[test]
    fn typical_flow_reaches_partial_sync() {
        let phase = CollectionsPhase::default()
            .on_event(PhaseEvent::CacheLoaded)
            .on_event(PhaseEvent::ClientCollectionAdded)
            .on_event(PhaseEvent::PartialSyncEvaluated { ready: true });
        assert_eq!(phase, CollectionsPhase::PartialSyncReady);
        assert!(phase.has_client_data());
        assert!(phase.is_decided());
    }

    #[test]
    fn unready_evaluation_requires_full_sync() {
        let phase = CollectionsPhase::Empty
            .on_event(PhaseEvent::CacheLoaded)
            .on_event(PhaseEvent::PartialSyncEvaluated { ready: false });
        assert_eq!(phase, CollectionsPhase::FullSyncRequired);
        assert!(!phase.has_client_data());
    }

    #[test]
    fn decided_phase_ignores_late_events() {
        let phase = CollectionsPhase::FullSyncRequired;
        assert_eq!(
            phase.on_event(PhaseEvent::ClientCollectionAdded),
            CollectionsPhase::FullSyncRequired
        );
        assert_eq!(phase.on_event(PhaseEvent::Reset), CollectionsPhase::Empty);
    }

    #[test]
    fn cache_reload_keeps_client_merge() {
        let phase = CollectionsPhase::MergedWithClient.on_event(PhaseEvent::CacheLoaded);
        assert_eq!(phase, CollectionsPhase::MergedWithClient);
    }

    #[test]
    fn unknown_collection_differs() {
        assert!(materially_differs(&CollectionState::new("INBOX"), None));
    }

    #[test]
    fn omitted_fields_do_not_count_as_changes() {
        let key = SyncKey::new_series();
        let cached = CollectionState {
            filter_type: Some(FilterType(5)),
            sync_key: Some(key.clone()),
            ..CollectionState::new("INBOX")
        };

        let same = CollectionState {
            sync_key: Some(key),
            ..CollectionState::new("INBOX")
        };
        assert!(!materially_differs(&same, Some(&cached)));

        let new_filter = CollectionState {
            filter_type: Some(FilterType(6)),
            ..same.clone()
        };
        assert!(materially_differs(&new_filter, Some(&cached)));
    }

    #[test]
    fn new_sync_key_differs() {
        let key = SyncKey::new_series();
        let cached = CollectionState {
            sync_key: Some(key.clone()),
            ..CollectionState::new("INBOX")
        };
        let client = CollectionState {
            sync_key: Some(key.next()),
            ..CollectionState::new("INBOX")
        };
        assert!(materially_differs(&client, Some(&cached)));
    }
}
