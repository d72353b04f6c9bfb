//! # sync-core
//!
//! Pure sync-state logic (no I/O, instant tests).
//!
//! This crate implements the algorithms of the sync-state core without any
//! database or backend access:
//! - [`Stamp`] - folder snapshots and change detection
//! - [`is_conflict`] - the conflict rule for client operations
//! - [`CacheData`] - the per-device sync cache model with field-level merge
//! - [`CollectionsPhase`] - the collection working-set phase machine
//! - [`Exporter`] - streaming server changes to a wire [`Encoder`]
//!
//! The actual I/O (storage, backend calls, long-polling) is performed by
//! `sync-state`, which drives these types.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod collections;
pub mod conflict;
pub mod exporter;
pub mod stamp;

pub use cache::{
    BodyPreference, CacheData, CollectionField, CollectionState, FieldMask, FolderInfo,
    SyncKeyCounter,
};
pub use collections::{materially_differs, CollectionsPhase, PhaseEvent};
pub use conflict::is_conflict;
pub use exporter::{Encoder, Exporter, FolderChange, RecordingEncoder, Tag, Token};
pub use stamp::{Stamp, StampDelta};
