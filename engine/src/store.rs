//! Bookmark store: the mutation surface over the persistence layer.
//!
//! Folders live in a single index key; each folder's trades live under their
//! own key so one folder's edits never rewrite another's list. Deletions
//! append a tombstone to a local-only key so the merge can suppress stale
//! copies arriving from other devices.

use crate::error::Result;
use crate::merge::{merge_with_retention, MergeOutcome};
use crate::model::{Folder, SavedSearch, Tombstone};
use crate::snapshot::SyncSnapshot;
use crate::storage::{
    trade_list_key, PersistenceLayer, KEY_FOLDER_INDEX, KEY_LAST_SYNCED_AT, KEY_TOMBSTONES,
    TRADE_LIST_PREFIX,
};
use crate::{Error, FolderId, Timestamp, TradeId};
use std::sync::Arc;
use tokio::sync::Mutex;

/// CRUD over folders and saved searches, backed by a [`PersistenceLayer`].
pub struct BookmarkStore {
    layer: Arc<PersistenceLayer>,
    /// Serializes mutations with snapshot reads and application. A merge
    /// result must never overwrite an edit made after its inputs were read,
    /// so anything that writes replicable state holds this lock.
    lock: Mutex<()>,
}

impl BookmarkStore {
    pub fn new(layer: Arc<PersistenceLayer>) -> Self {
        Self {
            layer,
            lock: Mutex::new(()),
        }
    }

    async fn read_folders(&self) -> Result<Vec<Folder>> {
        Ok(self
            .layer
            .get_json(KEY_FOLDER_INDEX)
            .await?
            .unwrap_or_default())
    }

    async fn write_folders(&self, folders: &[Folder]) -> Result<()> {
        self.layer.set_json(KEY_FOLDER_INDEX, &folders).await
    }

    async fn read_trades(&self, folder_id: &str) -> Result<Vec<SavedSearch>> {
        Ok(self
            .layer
            .get_json(&trade_list_key(folder_id))
            .await?
            .unwrap_or_default())
    }

    async fn write_trades(&self, folder_id: &str, trades: &[SavedSearch]) -> Result<()> {
        self.layer
            .set_json(&trade_list_key(folder_id), &trades)
            .await
    }

    async fn record_tombstone(&self, tombstone: Tombstone) -> Result<()> {
        let mut tombstones = self.tombstones().await?;
        tombstones.retain(|t| t.id != tombstone.id);
        tombstones.push(tombstone);
        self.layer.set_json(KEY_TOMBSTONES, &tombstones).await
    }

    /// All folders, in stored (user-chosen) order.
    pub async fn folders(&self) -> Result<Vec<Folder>> {
        self.read_folders().await
    }

    /// Folders not archived, for default views.
    pub async fn visible_folders(&self) -> Result<Vec<Folder>> {
        let mut folders = self.read_folders().await?;
        folders.retain(|f| !f.is_archived());
        Ok(folders)
    }

    /// Create a folder at the end of the index and return it.
    pub async fn create_folder(&self, title: impl Into<String>, now: Timestamp) -> Result<Folder> {
        let _guard = self.lock.lock().await;
        let folder = Folder::new(title, now);
        let mut folders = self.read_folders().await?;
        folders.push(folder.clone());
        self.write_folders(&folders).await?;
        Ok(folder)
    }

    async fn mutate_folder(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Folder),
    ) -> Result<Folder> {
        let _guard = self.lock.lock().await;
        let mut folders = self.read_folders().await?;
        let folder = folders
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| Error::FolderNotFound(id.to_string()))?;
        mutate(folder);
        let updated = folder.clone();
        self.write_folders(&folders).await?;
        Ok(updated)
    }

    pub async fn rename_folder(
        &self,
        id: &str,
        title: impl Into<String>,
        now: Timestamp,
    ) -> Result<Folder> {
        let title = title.into();
        self.mutate_folder(id, |f| f.rename(title, now)).await
    }

    pub async fn archive_folder(&self, id: &str, now: Timestamp) -> Result<Folder> {
        self.mutate_folder(id, |f| f.archive(now)).await
    }

    pub async fn unarchive_folder(&self, id: &str, now: Timestamp) -> Result<Folder> {
        self.mutate_folder(id, |f| f.unarchive(now)).await
    }

    /// Reorder the folder index. Ids listed in `order` come first, in that
    /// order; folders not listed keep their relative order after them. Every
    /// folder's stamp is bumped so the new order wins the merge.
    pub async fn reorder_folders(&self, order: &[FolderId], now: Timestamp) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut folders = self.read_folders().await?;
        for id in order {
            if !folders.iter().any(|f| &f.id == id) {
                return Err(Error::FolderNotFound(id.clone()));
            }
        }

        let mut reordered = Vec::with_capacity(folders.len());
        for id in order {
            if let Some(pos) = folders.iter().position(|f| &f.id == id) {
                reordered.push(folders.remove(pos));
            }
        }
        reordered.append(&mut folders);
        for folder in &mut reordered {
            folder.touch(now);
        }
        self.write_folders(&reordered).await
    }

    /// Delete a folder, its trade list, and leave a tombstone behind.
    pub async fn delete_folder(&self, id: &str, now: Timestamp) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut folders = self.read_folders().await?;
        let before = folders.len();
        folders.retain(|f| f.id != id);
        if folders.len() == before {
            return Err(Error::FolderNotFound(id.to_string()));
        }
        self.write_folders(&folders).await?;
        self.layer.delete(&trade_list_key(id)).await?;
        self.record_tombstone(Tombstone::folder(id, now)).await
    }

    /// Trades in a folder, stored order.
    pub async fn trades(&self, folder_id: &str) -> Result<Vec<SavedSearch>> {
        self.read_trades(folder_id).await
    }

    /// Append a trade to an existing folder.
    pub async fn add_trade(&self, folder_id: &str, trade: SavedSearch) -> Result<()> {
        let _guard = self.lock.lock().await;
        let folders = self.read_folders().await?;
        if !folders.iter().any(|f| f.id == folder_id) {
            return Err(Error::FolderNotFound(folder_id.to_string()));
        }
        let mut trades = self.read_trades(folder_id).await?;
        trades.push(trade);
        self.write_trades(folder_id, &trades).await
    }

    /// Replace a trade in place by id.
    pub async fn update_trade(&self, folder_id: &str, trade: SavedSearch) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut trades = self.read_trades(folder_id).await?;
        let slot = trades
            .iter_mut()
            .find(|t| t.id == trade.id)
            .ok_or_else(|| Error::TradeNotFound(trade.id.clone()))?;
        *slot = trade;
        self.write_trades(folder_id, &trades).await
    }

    /// Delete a trade and leave a tombstone behind.
    pub async fn delete_trade(
        &self,
        folder_id: &str,
        trade_id: &TradeId,
        now: Timestamp,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut trades = self.read_trades(folder_id).await?;
        let before = trades.len();
        trades.retain(|t| &t.id != trade_id);
        if trades.len() == before {
            return Err(Error::TradeNotFound(trade_id.clone()));
        }
        self.write_trades(folder_id, &trades).await?;
        self.record_tombstone(Tombstone::bookmark(trade_id.clone(), now))
            .await
    }

    /// Current deletion markers.
    pub async fn tombstones(&self) -> Result<Vec<Tombstone>> {
        Ok(self
            .layer
            .get_json(KEY_TOMBSTONES)
            .await?
            .unwrap_or_default())
    }

    pub async fn last_synced_at(&self) -> Result<Timestamp> {
        Ok(self
            .layer
            .get_json(KEY_LAST_SYNCED_AT)
            .await?
            .unwrap_or_default())
    }

    pub async fn set_last_synced_at(&self, at: Timestamp) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write_last_synced_at(at).await
    }

    async fn write_last_synced_at(&self, at: Timestamp) -> Result<()> {
        self.layer.set_json(KEY_LAST_SYNCED_AT, &at).await
    }

    /// Assemble all replicable state into a snapshot. Trade lists are
    /// discovered by key scan so groups orphaned by a concurrent folder
    /// delete still replicate (the merge drops them once the tombstone wins).
    pub async fn local_snapshot(&self) -> Result<SyncSnapshot> {
        let _guard = self.lock.lock().await;
        self.snapshot_inner().await
    }

    async fn snapshot_inner(&self) -> Result<SyncSnapshot> {
        let mut snapshot = SyncSnapshot::new();
        snapshot.folders = self.read_folders().await?;
        for key in self.layer.keys_with_prefix(TRADE_LIST_PREFIX).await? {
            let folder_id = key[TRADE_LIST_PREFIX.len()..].to_string();
            let trades = self.read_trades(&folder_id).await?;
            if !trades.is_empty() {
                snapshot.trades.insert(folder_id, trades);
            }
        }
        snapshot.tombstones = self.tombstones().await?;
        snapshot.last_synced_at = self.last_synced_at().await?;
        Ok(snapshot)
    }

    /// Overwrite all replicable state from a merged snapshot.
    pub async fn apply_snapshot(&self, snapshot: &SyncSnapshot) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.apply_inner(snapshot).await
    }

    /// Merge a remote snapshot into the current local state and apply the
    /// result, all under the store lock. The local side is re-read after the
    /// lock is taken, so edits made while the remote copy was in flight are
    /// part of the merge instead of being overwritten by it.
    pub async fn fold_snapshot(
        &self,
        remote: &SyncSnapshot,
        now: Timestamp,
        retention_ms: u64,
    ) -> Result<MergeOutcome> {
        let _guard = self.lock.lock().await;
        let local = self.snapshot_inner().await?;
        let outcome = merge_with_retention(&local, remote, now, retention_ms);
        self.apply_inner(&outcome.snapshot).await?;
        Ok(outcome)
    }

    async fn apply_inner(&self, snapshot: &SyncSnapshot) -> Result<()> {
        self.write_folders(&snapshot.folders).await?;

        for (folder_id, trades) in &snapshot.trades {
            self.write_trades(folder_id, trades).await?;
        }
        // Drop trade lists the merge no longer carries
        for key in self.layer.keys_with_prefix(TRADE_LIST_PREFIX).await? {
            let folder_id = &key[TRADE_LIST_PREFIX.len()..];
            if !snapshot.trades.contains_key(folder_id) {
                self.layer.delete(&key).await?;
            }
        }

        self.layer
            .set_json(KEY_TOMBSTONES, &snapshot.tombstones)
            .await?;
        self.write_last_synced_at(snapshot.last_synced_at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TombstoneKind, TradeLocation};
    use crate::storage::{ChangeBus, MemoryBackend};
    use serde_json::json;

    fn test_store() -> BookmarkStore {
        let layer = PersistenceLayer::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBackend::new()),
            Arc::new(ChangeBus::new()),
        );
        BookmarkStore::new(Arc::new(layer))
    }

    fn test_trade(title: &str, now: u64) -> SavedSearch {
        SavedSearch::new(
            title,
            TradeLocation {
                version: "2".into(),
                search_type: "search".into(),
                league: "Standard".into(),
                slug: "slug".into(),
            },
            json!({"query": {"term": title}}),
            now,
        )
    }

    #[tokio::test]
    async fn create_and_list_folders() {
        let store = test_store();
        let gear = store.create_folder("Gear", 100).await.unwrap();
        let maps = store.create_folder("Maps", 110).await.unwrap();

        let folders = store.folders().await.unwrap();
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[0].id, gear.id);
        assert_eq!(folders[1].id, maps.id);
    }

    #[tokio::test]
    async fn rename_bumps_stamp() {
        let store = test_store();
        let folder = store.create_folder("Gear", 100).await.unwrap();
        let renamed = store
            .rename_folder(&folder.id, "Weapons", 200)
            .await
            .unwrap();
        assert_eq!(renamed.title, "Weapons");
        assert_eq!(renamed.updated_at, 200);
    }

    #[tokio::test]
    async fn rename_missing_folder_fails() {
        let store = test_store();
        let err = store.rename_folder("nope", "x", 100).await.unwrap_err();
        assert_eq!(err, Error::FolderNotFound("nope".into()));
    }

    #[tokio::test]
    async fn archive_hides_from_visible_listing() {
        let store = test_store();
        let gear = store.create_folder("Gear", 100).await.unwrap();
        store.create_folder("Maps", 110).await.unwrap();

        store.archive_folder(&gear.id, 200).await.unwrap();
        let visible = store.visible_folders().await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].title, "Maps");

        // Still present in the full listing
        assert_eq!(store.folders().await.unwrap().len(), 2);

        store.unarchive_folder(&gear.id, 300).await.unwrap();
        assert_eq!(store.visible_folders().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reorder_touches_all_folders() {
        let store = test_store();
        let a = store.create_folder("A", 100).await.unwrap();
        let b = store.create_folder("B", 100).await.unwrap();
        let c = store.create_folder("C", 100).await.unwrap();

        store
            .reorder_folders(&[c.id.clone(), a.id.clone()], 500)
            .await
            .unwrap();

        let folders = store.folders().await.unwrap();
        let ids: Vec<&str> = folders.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec![c.id.as_str(), a.id.as_str(), b.id.as_str()]);
        assert!(folders.iter().all(|f| f.updated_at == 500));
    }

    #[tokio::test]
    async fn reorder_with_unknown_id_fails() {
        let store = test_store();
        store.create_folder("A", 100).await.unwrap();
        let err = store
            .reorder_folders(&["missing".to_string()], 200)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FolderNotFound(_)));
    }

    #[tokio::test]
    async fn delete_folder_leaves_tombstone_and_drops_trades() {
        let store = test_store();
        let folder = store.create_folder("Gear", 100).await.unwrap();
        store
            .add_trade(&folder.id, test_trade("Boots", 100))
            .await
            .unwrap();

        store.delete_folder(&folder.id, 200).await.unwrap();

        assert!(store.folders().await.unwrap().is_empty());
        assert!(store.trades(&folder.id).await.unwrap().is_empty());

        let tombstones = store.tombstones().await.unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].id, folder.id);
        assert_eq!(tombstones[0].kind, TombstoneKind::Folder);
        assert_eq!(tombstones[0].deleted_at, 200);
    }

    #[tokio::test]
    async fn trade_crud() {
        let store = test_store();
        let folder = store.create_folder("Gear", 100).await.unwrap();

        let boots = test_trade("Boots", 100);
        store.add_trade(&folder.id, boots.clone()).await.unwrap();
        assert_eq!(store.trades(&folder.id).await.unwrap().len(), 1);

        let mut updated = boots.clone();
        updated.title = "Boots 30% MS".into();
        updated.touch(200);
        store.update_trade(&folder.id, updated).await.unwrap();

        let trades = store.trades(&folder.id).await.unwrap();
        assert_eq!(trades[0].title, "Boots 30% MS");
        assert_eq!(trades[0].updated_at, 200);

        store
            .delete_trade(&folder.id, &boots.id, 300)
            .await
            .unwrap();
        assert!(store.trades(&folder.id).await.unwrap().is_empty());

        let tombstones = store.tombstones().await.unwrap();
        assert_eq!(tombstones[0].kind, TombstoneKind::Bookmark);
    }

    #[tokio::test]
    async fn add_trade_to_missing_folder_fails() {
        let store = test_store();
        let err = store
            .add_trade("nope", test_trade("Boots", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FolderNotFound(_)));
    }

    #[tokio::test]
    async fn update_missing_trade_fails() {
        let store = test_store();
        let folder = store.create_folder("Gear", 100).await.unwrap();
        let err = store
            .update_trade(&folder.id, test_trade("Ghost", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TradeNotFound(_)));
    }

    #[tokio::test]
    async fn deleting_same_id_twice_keeps_one_tombstone() {
        let store = test_store();
        let folder = store.create_folder("Gear", 100).await.unwrap();
        let trade = test_trade("Boots", 100);
        store.add_trade(&folder.id, trade.clone()).await.unwrap();
        store
            .delete_trade(&folder.id, &trade.id, 200)
            .await
            .unwrap();

        // Re-create with the same id, then delete again
        store.add_trade(&folder.id, trade.clone()).await.unwrap();
        store
            .delete_trade(&folder.id, &trade.id, 400)
            .await
            .unwrap();

        let tombstones = store.tombstones().await.unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].deleted_at, 400);
    }

    #[tokio::test]
    async fn snapshot_roundtrip_through_store() {
        let store = test_store();
        let folder = store.create_folder("Gear", 100).await.unwrap();
        store
            .add_trade(&folder.id, test_trade("Boots", 100))
            .await
            .unwrap();
        store.set_last_synced_at(1234).await.unwrap();

        let snapshot = store.local_snapshot().await.unwrap();
        assert_eq!(snapshot.folder_count(), 1);
        assert_eq!(snapshot.trade_count(), 1);
        assert_eq!(snapshot.last_synced_at, 1234);

        // Applying to a fresh store reproduces the state
        let other = test_store();
        other.apply_snapshot(&snapshot).await.unwrap();
        assert_eq!(other.local_snapshot().await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn apply_snapshot_drops_stale_trade_lists() {
        let store = test_store();
        let folder = store.create_folder("Gear", 100).await.unwrap();
        store
            .add_trade(&folder.id, test_trade("Boots", 100))
            .await
            .unwrap();

        // Merged state where the folder and its trades are gone
        let mut merged = SyncSnapshot::new();
        merged.tombstones.push(Tombstone::folder(&folder.id, 200));
        merged.last_synced_at = 500;

        store.apply_snapshot(&merged).await.unwrap();
        assert!(store.folders().await.unwrap().is_empty());
        assert!(store.trades(&folder.id).await.unwrap().is_empty());
        assert_eq!(store.last_synced_at().await.unwrap(), 500);
    }

    #[tokio::test]
    async fn fold_snapshot_merges_remote_state_in_place() {
        let store = test_store();
        let gear = store.create_folder("Gear", 100).await.unwrap();

        // A remote copy carrying a folder this store has never seen
        let mut remote = SyncSnapshot::new();
        remote.add_folder(Folder::new("Maps", 150));
        remote.last_synced_at = 150;

        let outcome = store.fold_snapshot(&remote, 200, 1_000).await.unwrap();
        assert!(outcome.has_new_external_data);

        let folders = store.folders().await.unwrap();
        let titles: Vec<&str> = folders.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(titles, vec!["Gear", "Maps"]);
        assert_eq!(folders[0].id, gear.id);
    }

    #[tokio::test]
    async fn empty_trade_lists_omitted_from_snapshot() {
        let store = test_store();
        let folder = store.create_folder("Gear", 100).await.unwrap();
        let trade = test_trade("Boots", 100);
        store.add_trade(&folder.id, trade.clone()).await.unwrap();
        store
            .delete_trade(&folder.id, &trade.id, 200)
            .await
            .unwrap();

        let snapshot = store.local_snapshot().await.unwrap();
        assert!(snapshot.trades.is_empty());
    }
}
