//! StashMark sync engine: local-first replication for trade-site bookmarks.
//!
//! Folders of saved searches live in a dual-tier key/value store and
//! replicate through a single compressed snapshot key in a small
//! quota-constrained remote area. Convergence uses whole-record
//! last-write-wins on wall-clock stamps plus tombstones for deletions;
//! there is no cross-device locking and no operation log.
//!
//! # Architecture
//!
//! - [`storage`]: key routing between the local and syncable areas, quota
//!   accounting, change notification, expiry, and the sync-toggle migration.
//! - [`store`]: the folder/trade mutation surface over the storage layer.
//! - [`snapshot`] and [`codec`]: the unit of replication and its compressed
//!   transport encoding.
//! - [`merge`]: pure, deterministic snapshot convergence.
//! - [`orchestrator`]: pull on startup, debounced push on mutation, status.

pub mod codec;
pub mod error;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod snapshot;
pub mod storage;
pub mod store;

pub use error::{Error, Result};
pub use merge::{merge, merge_with_retention, MergeOutcome, TOMBSTONE_RETENTION_MS};
pub use model::{Folder, SavedSearch, Tombstone, TombstoneKind, TradeLocation};
pub use orchestrator::{PushOutcome, SyncConfig, SyncOrchestrator, SyncOutcome, SyncStatus};
pub use snapshot::SyncSnapshot;
pub use storage::{ChangeBus, MemoryBackend, PersistenceLayer, QuotaUsage, StorageBackend};
pub use store::BookmarkStore;

/// Identifier of a bookmark folder.
pub type FolderId = String;

/// Identifier of a saved search.
pub type TradeId = String;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
