//! # sync-state
//!
//! Persistent sync state for ActiveSync-style devices.
//!
//! This crate drives the pure logic of `sync-core` against storage and a
//! backend item store:
//! - [`SyncCache`] - the per-device, per-user cache with optimistic saves
//! - [`Collections`] - the per-request collection working set and long-poll
//! - [`StateMachine`] - sync-key progression and server change computation
//! - [`Importer`] - applying client changes to the backend
//! - [`SyncLocks`] - serializing requests per collection
//!
//! ## Architecture
//!
//! ```text
//!   request ──► Collections ──► SyncCache ──┐
//!                   │                       │
//!                   ▼                       ▼
//!   Importer ──► StateMachine ──────► StateStorage (SQLite)
//!      │              │
//!      └──────┬───────┘
//!             ▼
//!     Driver (+ LogLayer, TimerLayer)
//! ```
//!
//! ## Sync round
//!
//! 1. Load the [`SyncCache`] and build a [`Collections`] working set
//! 2. For each collection, [`StateMachine::load_state`] at the client's key
//! 3. Apply client changes with the [`Importer`]
//! 4. Send [`StateMachine::get_changes`] through a `sync_core::Exporter`
//! 5. [`StateMachine::save`] the new key, then save the cache

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod cleanup;
pub mod collections;
pub mod config;
pub mod error;
pub mod importer;
pub mod locks;
pub mod state;
pub mod storage;
pub mod sync_cache;

pub use backend::{Driver, DriverError, LogLayer, MockDriver, TimerLayer};
pub use cleanup::spawn_cleanup_task;
pub use collections::{Collections, PollOutcome};
pub use config::Config;
pub use error::{Result, StateError, StorageError};
pub use importer::{DeleteResult, ImportOutcome, Importer, MoveResult};
pub use locks::{CollectionGuard, SyncLocks};
pub use state::StateMachine;
pub use storage::{SqliteStorage, StateStorage};
pub use sync_cache::SyncCache;
