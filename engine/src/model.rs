//! Record types for bookmark folders and saved trade searches.
//!
//! Only two record kinds replicate: [`Folder`] and [`SavedSearch`]. Both carry
//! a wall-clock `updated_at` stamp that is the sole ordering signal for merge.
//! Clock skew across devices is an accepted risk; timestamp comparison is
//! best-effort ordering, not a correctness guarantee.

use crate::{FolderId, Timestamp, TradeId};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current wall-clock time in milliseconds since epoch.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// A named grouping of saved searches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    /// Stable unique identifier, assigned at creation, never reused
    pub id: FolderId,
    /// User-editable display string
    pub title: String,
    /// Non-null marks the folder hidden from default views, not deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<Timestamp>,
    /// Set on every mutation; sole ordering signal for merge
    pub updated_at: Timestamp,
}

impl Folder {
    /// Create a new folder with a freshly assigned id.
    pub fn new(title: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            archived_at: None,
            updated_at: now,
        }
    }

    /// Rebuild a folder from its stored parts (used by tests and import paths).
    pub fn with_id(
        id: impl Into<FolderId>,
        title: impl Into<String>,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            archived_at: None,
            updated_at,
        }
    }

    pub fn rename(&mut self, title: impl Into<String>, now: Timestamp) {
        self.title = title.into();
        self.updated_at = now;
    }

    pub fn archive(&mut self, now: Timestamp) {
        self.archived_at = Some(now);
        self.updated_at = now;
    }

    pub fn unarchive(&mut self, now: Timestamp) {
        self.archived_at = None;
        self.updated_at = now;
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Bump the mutation stamp without changing payload (used by reorder).
    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at = now;
    }
}

/// Where a saved search points on the trade site. Opaque to the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeLocation {
    /// Site version
    pub version: String,
    /// Search type (e.g. item search vs bulk exchange)
    pub search_type: String,
    /// League or realm
    pub league: String,
    /// Result-page slug
    pub slug: String,
}

/// A saved search ("trade") belonging to exactly one folder.
///
/// Everything except `id` and `updated_at` is application payload the merge
/// logic copies verbatim. In particular `query_payload` is produced by the
/// external query parser and is never inspected beyond copying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSearch {
    /// Stable unique identifier
    pub id: TradeId,
    pub title: String,
    pub location: TradeLocation,
    /// Opaque structured filter, stored and forwarded verbatim
    pub query_payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_image_url: Option<String>,
    /// Set on every mutation; sole ordering signal for merge
    pub updated_at: Timestamp,
}

impl SavedSearch {
    /// Create a new saved search with a freshly assigned id.
    pub fn new(
        title: impl Into<String>,
        location: TradeLocation,
        query_payload: serde_json::Value,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            location,
            query_payload,
            result_count: None,
            preview_image_url: None,
            updated_at: now,
        }
    }

    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at = now;
    }
}

/// Which record kind a tombstone marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TombstoneKind {
    Folder,
    Bookmark,
}

/// A deletion marker.
///
/// A tombstone for id X suppresses reintroduction of any record X whose
/// `updated_at` is older than `deleted_at`. A record with a newer stamp wins
/// (a later re-create after the deletion was observed elsewhere).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// Matches the deleted folder or trade id
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TombstoneKind,
    pub deleted_at: Timestamp,
}

impl Tombstone {
    pub fn folder(id: impl Into<String>, deleted_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            kind: TombstoneKind::Folder,
            deleted_at,
        }
    }

    pub fn bookmark(id: impl Into<String>, deleted_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            kind: TombstoneKind::Bookmark,
            deleted_at,
        }
    }

    /// Whether this tombstone suppresses a record last touched at `updated_at`.
    pub fn suppresses(&self, updated_at: Timestamp) -> bool {
        self.deleted_at > updated_at
    }
}
