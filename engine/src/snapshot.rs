//! The unit of replication: everything that syncs travels as one snapshot.
//!
//! Uses `BTreeMap` for the trades map so serialization order is deterministic,
//! which keeps the push dedupe comparison stable across runs.

use crate::{Folder, FolderId, SavedSearch, Timestamp, Tombstone};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A point-in-time view of all replicable state.
///
/// Invariant (post-merge): every folder id key in `trades` should correspond
/// to a folder in `folders`. Orphaned trade groups are permitted transiently
/// and are simply not surfaced in listings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub folders: Vec<Folder>,
    pub trades: BTreeMap<FolderId, Vec<SavedSearch>>,
    pub tombstones: Vec<Tombstone>,
    pub last_synced_at: Timestamp,
}

impl SyncSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a folder.
    pub fn add_folder(&mut self, folder: Folder) {
        self.folders.push(folder);
    }

    /// Add a trade under its parent folder.
    pub fn add_trade(&mut self, folder_id: impl Into<FolderId>, trade: SavedSearch) {
        self.trades.entry(folder_id.into()).or_default().push(trade);
    }

    /// Look up a folder by id.
    pub fn folder(&self, id: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.id == id)
    }

    /// Trades belonging to a folder, empty slice if none.
    pub fn trades_for(&self, folder_id: &str) -> &[SavedSearch] {
        self.trades
            .get(folder_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn folder_count(&self) -> usize {
        self.folders.len()
    }

    pub fn trade_count(&self) -> usize {
        self.trades.values().map(Vec::len).sum()
    }

    /// True when nothing replicable is present (tombstones included).
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.trades.is_empty() && self.tombstones.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TradeLocation;
    use serde_json::json;

    fn test_trade(id: &str, updated_at: u64) -> SavedSearch {
        SavedSearch {
            id: id.into(),
            title: format!("trade {id}"),
            location: TradeLocation {
                version: "2".into(),
                search_type: "search".into(),
                league: "Standard".into(),
                slug: "slug".into(),
            },
            query_payload: json!({"q": id}),
            result_count: None,
            preview_image_url: None,
            updated_at,
        }
    }

    #[test]
    fn empty_snapshot() {
        let snapshot = SyncSnapshot::new();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.folder_count(), 0);
        assert_eq!(snapshot.trade_count(), 0);
        assert_eq!(snapshot.trades_for("f1"), &[]);
    }

    #[test]
    fn add_and_count() {
        let mut snapshot = SyncSnapshot::new();
        snapshot.add_folder(Folder::with_id("f1", "Gear", 100));
        snapshot.add_trade("f1", test_trade("t1", 100));
        snapshot.add_trade("f1", test_trade("t2", 100));

        assert_eq!(snapshot.folder_count(), 1);
        assert_eq!(snapshot.trade_count(), 2);
        assert_eq!(snapshot.trades_for("f1").len(), 2);
        assert!(snapshot.folder("f1").is_some());
        assert!(snapshot.folder("f2").is_none());
    }

    #[test]
    fn serialization_roundtrip() {
        let mut snapshot = SyncSnapshot::new();
        snapshot.add_folder(Folder::with_id("f1", "Gear", 100));
        snapshot.add_trade("f1", test_trade("t1", 100));
        snapshot.tombstones.push(Tombstone::folder("f0", 50));
        snapshot.last_synced_at = 1234;

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("lastSyncedAt"));

        let parsed: SyncSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn deterministic_trade_map_order() {
        let mut a = SyncSnapshot::new();
        a.add_trade("f2", test_trade("t2", 100));
        a.add_trade("f1", test_trade("t1", 100));

        let mut b = SyncSnapshot::new();
        b.add_trade("f1", test_trade("t1", 100));
        b.add_trade("f2", test_trade("t2", 100));

        // BTreeMap keys serialize in the same order regardless of insertion
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
