//! Sync orchestrator: pulls remote state on startup and visibility, pushes
//! local state after a debounce window, and reports status.
//!
//! There is no cross-device locking. The remote snapshot key is a
//! last-physical-write-wins register; convergence comes from every push
//! folding the current remote state in through the merge engine before
//! overwriting it.

use crate::codec;
use crate::error::Result;
use crate::merge::{merge_with_retention, TOMBSTONE_RETENTION_MS};
use crate::model::{now_millis, Folder, SavedSearch};
use crate::snapshot::SyncSnapshot;
use crate::storage::{PersistenceLayer, QuotaUsage, KEY_REMOTE_SNAPSHOT};
use crate::store::BookmarkStore;
use crate::{Error, FolderId, Timestamp, TradeId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Quiet period after the last mutation before a push fires.
pub const PUSH_DEBOUNCE: Duration = Duration::from_secs(5);

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub push_debounce: Duration,
    /// How long merged tombstones keep suppressing resurrections.
    pub tombstone_retention_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_debounce: PUSH_DEBOUNCE,
            tombstone_retention_ms: TOMBSTONE_RETENTION_MS,
        }
    }
}

/// What a push did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The remote snapshot was overwritten
    Written,
    /// Local state matched the last pushed snapshot; nothing written
    Unchanged,
    /// Sync is off; nothing to do
    SyncDisabled,
}

/// Structured result of a user-requested push, shaped for direct display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaUsage>,
}

/// Point-in-time sync health, for settings/status views.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub sync_enabled: bool,
    pub folder_count: usize,
    pub trade_count: usize,
    pub last_synced_at: Timestamp,
    pub quota: QuotaUsage,
    pub has_new_external_data: bool,
}

/// Push bookkeeping guarded by one async mutex so concurrent pushes from the
/// debounce task and a forced push serialize.
struct PushState {
    /// Compressed form of the last snapshot this context wrote remotely.
    /// Compared against a recompression of current state to skip no-op pushes.
    last_pushed: Option<String>,
}

/// Drives replication between the local store and the remote snapshot key.
pub struct SyncOrchestrator {
    layer: Arc<PersistenceLayer>,
    store: BookmarkStore,
    config: SyncConfig,
    push_state: Mutex<PushState>,
    /// Bumped by every schedule; a sleeping debounce task only pushes if its
    /// generation is still current, so rescheduling cancels the pending push.
    generation: AtomicU64,
    new_data: Arc<watch::Sender<bool>>,
}

impl SyncOrchestrator {
    pub fn new(layer: Arc<PersistenceLayer>, config: SyncConfig) -> Arc<Self> {
        let (new_data, _) = watch::channel(false);
        let new_data = Arc::new(new_data);

        // Another context replacing the remote snapshot means data arrived
        // from elsewhere; raise the flag so this context knows to re-pull.
        let flag = new_data.clone();
        layer.on_key_change(KEY_REMOTE_SNAPSHOT, move |_| {
            flag.send_replace(true);
        });

        let store = BookmarkStore::new(layer.clone());
        Arc::new(Self {
            layer,
            store,
            config,
            push_state: Mutex::new(PushState { last_pushed: None }),
            generation: AtomicU64::new(0),
            new_data,
        })
    }

    /// Read-only access to the underlying store.
    pub fn store(&self) -> &BookmarkStore {
        &self.store
    }

    /// Turn sync on: migrate local state to the syncable area, fold in
    /// whatever is already remote, then push the converged state.
    pub async fn enable_sync(&self) -> Result<()> {
        self.layer.enable_sync().await?;
        self.pull().await?;
        self.push().await?;
        Ok(())
    }

    /// Turn sync off. Local state is preserved; the remote copy is left as a
    /// parting snapshot for other devices.
    pub async fn disable_sync(&self) -> Result<()> {
        self.layer.disable_sync().await
    }

    /// Fetch the remote snapshot and fold it into local state.
    ///
    /// Missing or undecodable remote data is a no-op, never an error. Returns
    /// whether the merge surfaced data new to this device; the pull time is
    /// recorded only when it did, so a no-op pull leaves the last sync stamp
    /// alone.
    pub async fn pull(&self) -> Result<bool> {
        if !self.layer.is_sync_enabled() {
            return Ok(false);
        }

        let Some(raw) = self.layer.remote_get(KEY_REMOTE_SNAPSHOT).await? else {
            tracing::debug!("no remote snapshot yet");
            return Ok(false);
        };
        let Some(remote) = codec::decompress(&raw) else {
            tracing::warn!(error = %Error::DecodeFailure, "ignoring remote snapshot");
            return Ok(false);
        };

        let now = now_millis();
        let outcome = self
            .store
            .fold_snapshot(&remote, now, self.config.tombstone_retention_ms)
            .await?;

        if outcome.has_new_external_data {
            self.store.set_last_synced_at(now).await?;
            self.new_data.send_replace(true);
        }
        Ok(outcome.has_new_external_data)
    }

    /// Merge local state with the current remote snapshot and overwrite the
    /// remote key with the converged result.
    ///
    /// Skips the write when the converged state matches what this context
    /// last pushed: the candidate is compressed with the *previously
    /// persisted* `last_synced_at`, so an unchanged state compresses to the
    /// identical string. Only a genuinely different snapshot gets stamped
    /// with a fresh sync time and written.
    pub async fn push(&self) -> Result<PushOutcome> {
        if !self.layer.is_sync_enabled() {
            return Ok(PushOutcome::SyncDisabled);
        }

        let mut state = self.push_state.lock().await;
        let now = now_millis();

        let local = self.store.local_snapshot().await?;
        let remote = match self.layer.remote_get(KEY_REMOTE_SNAPSHOT).await? {
            Some(raw) => codec::decompress(&raw).unwrap_or_else(|| {
                tracing::warn!(error = %Error::DecodeFailure, "replacing remote snapshot");
                SyncSnapshot::default()
            }),
            None => SyncSnapshot::default(),
        };
        let outcome = merge_with_retention(&local, &remote, now, self.config.tombstone_retention_ms);
        if outcome.has_new_external_data {
            self.new_data.send_replace(true);
        }

        let candidate = codec::compress(&outcome.snapshot)?;
        if state.last_pushed.as_deref() == Some(candidate.as_str()) {
            tracing::debug!("push skipped, state unchanged");
            return Ok(PushOutcome::Unchanged);
        }

        let mut stamped = outcome.snapshot;
        stamped.last_synced_at = now;
        let packed = codec::compress(&stamped)?;

        self.layer
            .remote_set(KEY_REMOTE_SNAPSHOT, packed.clone())
            .await?;
        // Fold the pre-write remote into local state rather than applying the
        // merge computed above: the store re-reads itself under its own lock,
        // so an edit made while the remote write was in flight survives and
        // rides the next push.
        self.store
            .fold_snapshot(&remote, now, self.config.tombstone_retention_ms)
            .await?;
        self.store.set_last_synced_at(now).await?;
        state.last_pushed = Some(packed);

        tracing::debug!(
            folders = stamped.folder_count(),
            trades = stamped.trade_count(),
            "pushed snapshot"
        );
        Ok(PushOutcome::Written)
    }

    /// Schedule a debounced push. Each call restarts the quiet period;
    /// a burst of mutations collapses into one push.
    pub fn schedule_push(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.push_debounce).await;
            if this.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            // Background pushes must not surface errors to the user; the
            // next mutation or forced push retries.
            if let Err(err) = this.push().await {
                tracing::warn!(error = %err, "scheduled push failed");
            }
        });
    }

    /// User-requested immediate push. Unlike scheduled pushes, failures are
    /// reported verbatim, alongside current quota usage.
    pub async fn force_push(&self) -> SyncOutcome {
        let result = self.push().await;
        let quota = self.layer.usage().await.ok();
        match result {
            Ok(_) => SyncOutcome {
                success: true,
                error: None,
                quota,
            },
            Err(err) => SyncOutcome {
                success: false,
                error: Some(err.to_string()),
                quota,
            },
        }
    }

    /// Current sync health.
    pub async fn status(&self) -> Result<SyncStatus> {
        let snapshot = self.store.local_snapshot().await?;
        Ok(SyncStatus {
            sync_enabled: self.layer.is_sync_enabled(),
            folder_count: snapshot.folder_count(),
            trade_count: snapshot.trade_count(),
            last_synced_at: snapshot.last_synced_at,
            quota: self.layer.usage().await?,
            has_new_external_data: *self.new_data.borrow(),
        })
    }

    /// Watch the new-external-data flag; raised by pulls that surface remote
    /// records and by other contexts replacing the remote snapshot.
    pub fn subscribe_new_data(&self) -> watch::Receiver<bool> {
        self.new_data.subscribe()
    }

    /// Lower the new-external-data flag after the UI has refreshed.
    pub fn acknowledge_new_data(&self) {
        self.new_data.send_replace(false);
    }

    // Mutation surface: each delegates to the store, then schedules a push.

    pub async fn create_folder(
        self: &Arc<Self>,
        title: impl Into<String>,
    ) -> Result<Folder> {
        let folder = self.store.create_folder(title, now_millis()).await?;
        self.schedule_push();
        Ok(folder)
    }

    pub async fn rename_folder(
        self: &Arc<Self>,
        id: &str,
        title: impl Into<String>,
    ) -> Result<Folder> {
        let folder = self.store.rename_folder(id, title, now_millis()).await?;
        self.schedule_push();
        Ok(folder)
    }

    pub async fn archive_folder(self: &Arc<Self>, id: &str) -> Result<Folder> {
        let folder = self.store.archive_folder(id, now_millis()).await?;
        self.schedule_push();
        Ok(folder)
    }

    pub async fn unarchive_folder(self: &Arc<Self>, id: &str) -> Result<Folder> {
        let folder = self.store.unarchive_folder(id, now_millis()).await?;
        self.schedule_push();
        Ok(folder)
    }

    pub async fn reorder_folders(self: &Arc<Self>, order: &[FolderId]) -> Result<()> {
        self.store.reorder_folders(order, now_millis()).await?;
        self.schedule_push();
        Ok(())
    }

    pub async fn delete_folder(self: &Arc<Self>, id: &str) -> Result<()> {
        self.store.delete_folder(id, now_millis()).await?;
        self.schedule_push();
        Ok(())
    }

    pub async fn add_trade(self: &Arc<Self>, folder_id: &str, trade: SavedSearch) -> Result<()> {
        self.store.add_trade(folder_id, trade).await?;
        self.schedule_push();
        Ok(())
    }

    pub async fn update_trade(
        self: &Arc<Self>,
        folder_id: &str,
        trade: SavedSearch,
    ) -> Result<()> {
        self.store.update_trade(folder_id, trade).await?;
        self.schedule_push();
        Ok(())
    }

    pub async fn delete_trade(
        self: &Arc<Self>,
        folder_id: &str,
        trade_id: &TradeId,
    ) -> Result<()> {
        self.store
            .delete_trade(folder_id, trade_id, now_millis())
            .await?;
        self.schedule_push();
        Ok(())
    }
}
