//! Dual-tier persistence layer.
//!
//! Every logical key routes to one of two storage areas: a fast local-only
//! area, or a small quota-constrained syncable area shared across devices.
//! Routing is driven by a fixed allow-list of key-name prefixes and the
//! current sync mode. The layer also provides cross-context change
//! notification (listeners fire for writes from *other* execution contexts,
//! never the writer's own), lazy value expiry, quota accounting, and the
//! validated all-or-nothing migration that runs when sync is toggled.

use crate::error::Result;
use crate::model::now_millis;
use crate::{Error, Timestamp};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Total syncable-area quota in bytes (WebExtension `storage.sync` limit).
pub const SYNC_TOTAL_QUOTA_BYTES: usize = 102_400;
/// Per-item syncable-area quota in bytes.
pub const SYNC_ITEM_QUOTA_BYTES: usize = 8_192;
/// Maximum item count in the syncable area.
pub const SYNC_MAX_ITEMS: usize = 512;

/// Key holding the folder index (`Vec<Folder>`).
pub const KEY_FOLDER_INDEX: &str = "bookmarks.folders";
/// Key holding the tombstone list. Local-only: tombstones replicate inside
/// the compressed snapshot, not as a routed key.
pub const KEY_TOMBSTONES: &str = "bookmarks.tombstones";
/// Key holding recent search history.
pub const KEY_SEARCH_HISTORY: &str = "search.history";
/// Remote key holding the codec-compressed snapshot of all replicable state.
pub const KEY_REMOTE_SNAPSHOT: &str = "sync.snapshot";
/// Local key recording when the last successful push or pull happened.
pub const KEY_LAST_SYNCED_AT: &str = "sync.last-synced-at";

/// Prefix for per-folder trade list keys.
pub const TRADE_LIST_PREFIX: &str = "bookmarks.trades.";

/// Storage key for a folder's trade list.
pub fn trade_list_key(folder_id: &str) -> String {
    format!("{TRADE_LIST_PREFIX}{folder_id}")
}

/// Allow-list of syncable key prefixes. Everything else stays local-only
/// regardless of sync mode.
const SYNCABLE_PREFIXES: &[&str] = &[KEY_FOLDER_INDEX, TRADE_LIST_PREFIX, KEY_SEARCH_HISTORY];

/// Whether a key is eligible for the syncable area.
pub fn is_syncable_key(key: &str) -> bool {
    SYNCABLE_PREFIXES.iter().any(|p| key.starts_with(p))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stored wrapper around every value: carries an optional expiry.
/// Reads treat expired values as absent without eagerly deleting them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<Timestamp>,
}

impl Envelope {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A raw key/value storage area.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>>;
    async fn write(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory backend. A shared `Arc` stands in for the storage medium that
/// multiple execution contexts see; it doubles as the test backend, with an
/// injectable write failure for exercising transport-error paths.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    write_count: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail with a transport error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn write(&self, key: &str, value: String) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Transport("write rejected".into()));
        }
        lock(&self.entries).insert(key.to_string(), value);
        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(lock(&self.entries).keys().cloned().collect())
    }
}

/// Syncable-area usage, recomputed after every remote-tier write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub used_bytes: usize,
    pub total_bytes: usize,
    pub item_count: usize,
    pub max_items: usize,
    /// Used bytes at or above 80% of the total quota
    pub near_quota: bool,
    /// Item count at or above 90% of the item limit
    pub near_item_limit: bool,
}

impl QuotaUsage {
    pub fn percent_used(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

type KeyCallback = Box<dyn Fn(&str) + Send + Sync>;

enum KeyFilter {
    Exact(String),
    Prefix(String),
}

impl KeyFilter {
    fn matches(&self, key: &str) -> bool {
        match self {
            KeyFilter::Exact(k) => k == key,
            KeyFilter::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

struct Watcher {
    context_id: u64,
    filter: KeyFilter,
    callback: KeyCallback,
}

/// Shared change-notification bus across execution contexts.
///
/// Listeners registered by one context fire only for writes performed by a
/// *different* context, mirroring the storage medium's change events.
#[derive(Default)]
pub struct ChangeBus {
    watchers: Mutex<Vec<Watcher>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, context_id: u64, filter: KeyFilter, callback: KeyCallback) {
        lock(&self.watchers).push(Watcher {
            context_id,
            filter,
            callback,
        });
    }

    fn notify(&self, writer: u64, key: &str) {
        for watcher in lock(&self.watchers).iter() {
            if watcher.context_id != writer && watcher.filter.matches(key) {
                (watcher.callback)(key);
            }
        }
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The dual-tier persistence layer owned by one execution context.
pub struct PersistenceLayer {
    context_id: u64,
    local: Arc<dyn StorageBackend>,
    sync: Arc<dyn StorageBackend>,
    bus: Arc<ChangeBus>,
    sync_enabled: AtomicBool,
    total_quota: usize,
    item_quota: usize,
    max_items: usize,
    usage: Mutex<QuotaUsage>,
}

impl PersistenceLayer {
    /// Create a layer over the two storage areas. Each layer instance models
    /// one execution context; contexts on the same device share backends and
    /// the change bus.
    pub fn new(
        local: Arc<dyn StorageBackend>,
        sync: Arc<dyn StorageBackend>,
        bus: Arc<ChangeBus>,
    ) -> Self {
        Self {
            context_id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst),
            local,
            sync,
            bus,
            sync_enabled: AtomicBool::new(false),
            total_quota: SYNC_TOTAL_QUOTA_BYTES,
            item_quota: SYNC_ITEM_QUOTA_BYTES,
            max_items: SYNC_MAX_ITEMS,
            usage: Mutex::new(QuotaUsage::default()),
        }
    }

    /// Override the fixed quota limits (test hook).
    pub fn with_quota(mut self, total: usize, per_item: usize, max_items: usize) -> Self {
        self.total_quota = total;
        self.item_quota = per_item;
        self.max_items = max_items;
        self
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }

    fn routes_to_sync(&self, key: &str) -> bool {
        self.is_sync_enabled() && is_syncable_key(key)
    }

    fn tier(&self, key: &str) -> &Arc<dyn StorageBackend> {
        if self.routes_to_sync(key) {
            &self.sync
        } else {
            &self.local
        }
    }

    /// Read a value; expired values read as absent (lazy expiry).
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(raw) = self.tier(key).read(key).await? else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_str(&raw)?;
        if envelope.is_expired(now_millis()) {
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    /// Write a value with no expiry.
    pub async fn set(&self, key: &str, value: String) -> Result<()> {
        self.set_envelope(
            key,
            Envelope {
                value,
                expires_at: None,
            },
        )
        .await
    }

    /// Write a value that reads as absent after `ttl_ms`.
    pub async fn set_with_expiry(&self, key: &str, value: String, ttl_ms: u64) -> Result<()> {
        self.set_envelope(
            key,
            Envelope {
                value,
                expires_at: Some(now_millis() + ttl_ms),
            },
        )
        .await
    }

    async fn set_envelope(&self, key: &str, envelope: Envelope) -> Result<()> {
        let raw = serde_json::to_string(&envelope)?;
        let remote = self.routes_to_sync(key);
        if remote {
            self.check_quota(key, raw.len()).await?;
        }
        self.tier(key).write(key, raw).await?;
        self.bus.notify(self.context_id, key);
        if remote {
            self.recompute_usage().await?;
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let remote = self.routes_to_sync(key);
        self.tier(key).remove(key).await?;
        self.bus.notify(self.context_id, key);
        if remote {
            self.recompute_usage().await?;
        }
        Ok(())
    }

    /// Typed read.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Typed write.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, serde_json::to_string(value)?).await
    }

    /// Keys currently stored under a prefix, in the tier that prefix routes to.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self.tier(prefix).keys().await?;
        Ok(keys.into_iter().filter(|k| k.starts_with(prefix)).collect())
    }

    /// Fire `callback` when a *different* execution context writes `key`.
    pub fn on_key_change(&self, key: &str, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.bus.register(
            self.context_id,
            KeyFilter::Exact(key.to_string()),
            Box::new(callback),
        );
    }

    /// Fire `callback` when a *different* execution context writes any key
    /// under `prefix`.
    pub fn on_key_prefix_change(
        &self,
        prefix: &str,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) {
        self.bus.register(
            self.context_id,
            KeyFilter::Prefix(prefix.to_string()),
            Box::new(callback),
        );
    }

    /// Turn sync on: migrate all syncable local keys into the syncable area.
    ///
    /// The migration is validated up front against both the aggregate and the
    /// per-item quota and rejected as a whole if either would be exceeded;
    /// no partial tier migration is ever left in place (local state is read,
    /// never modified, and the sync flag only flips after every copy lands).
    pub async fn enable_sync(&self) -> Result<()> {
        if self.is_sync_enabled() {
            return Ok(());
        }

        let mut staged = Vec::new();
        for key in self.local.keys().await? {
            if !is_syncable_key(&key) {
                continue;
            }
            if let Some(raw) = self.local.read(&key).await? {
                staged.push((key, raw));
            }
        }

        let existing = self.recompute_usage().await?;
        let mut aggregate = existing.used_bytes;
        let mut count = existing.item_count;
        for (key, raw) in &staged {
            let size = key.len() + raw.len();
            if size > self.item_quota {
                return Err(Error::MigrationRejected(format!(
                    "record '{key}' is {size} bytes, per-item limit is {}",
                    self.item_quota
                )));
            }
            if let Some(current) = self.sync.read(key).await? {
                aggregate -= key.len() + current.len();
            } else {
                count += 1;
            }
            aggregate += size;
        }
        if aggregate > self.total_quota {
            return Err(Error::MigrationRejected(format!(
                "aggregate size {aggregate} bytes exceeds quota of {}",
                self.total_quota
            )));
        }
        if count > self.max_items {
            return Err(Error::MigrationRejected(format!(
                "{count} items exceed the limit of {}",
                self.max_items
            )));
        }

        let migrated = staged.len();
        for (key, raw) in staged {
            self.sync.write(&key, raw).await?;
            self.bus.notify(self.context_id, &key);
        }
        self.sync_enabled.store(true, Ordering::SeqCst);
        self.recompute_usage().await?;
        tracing::info!(migrated, "sync enabled");
        Ok(())
    }

    /// Turn sync off: copy syncable keys back to the local area. The remote
    /// copy is left in place.
    pub async fn disable_sync(&self) -> Result<()> {
        if !self.is_sync_enabled() {
            return Ok(());
        }

        for key in self.sync.keys().await? {
            if !is_syncable_key(&key) {
                continue;
            }
            if let Some(raw) = self.sync.read(&key).await? {
                self.local.write(&key, raw).await?;
                self.bus.notify(self.context_id, &key);
            }
        }
        self.sync_enabled.store(false, Ordering::SeqCst);
        tracing::info!("sync disabled");
        Ok(())
    }

    /// Read a raw value from the syncable area, bypassing key routing.
    /// Used for the single compressed-snapshot key.
    pub async fn remote_get(&self, key: &str) -> Result<Option<String>> {
        let Some(raw) = self.sync.read(key).await? else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_str(&raw)?;
        if envelope.is_expired(now_millis()) {
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    /// Write a value into the syncable area, bypassing key routing but not
    /// quota enforcement.
    pub async fn remote_set(&self, key: &str, value: String) -> Result<()> {
        let raw = serde_json::to_string(&Envelope {
            value,
            expires_at: None,
        })?;
        self.check_quota(key, raw.len()).await?;
        self.sync.write(key, raw).await?;
        self.bus.notify(self.context_id, key);
        self.recompute_usage().await?;
        Ok(())
    }

    async fn check_quota(&self, key: &str, stored_len: usize) -> Result<()> {
        let entry_size = key.len() + stored_len;
        if entry_size > self.item_quota {
            return Err(Error::ItemQuotaExceeded {
                key: key.to_string(),
                size: entry_size,
                limit: self.item_quota,
            });
        }

        let mut used = 0;
        let mut count = 0;
        let mut replacing = false;
        for existing in self.sync.keys().await? {
            let value_len = self
                .sync
                .read(&existing)
                .await?
                .map(|v| v.len())
                .unwrap_or(0);
            if existing == key {
                replacing = true;
                continue;
            }
            used += existing.len() + value_len;
            count += 1;
        }

        if used + entry_size > self.total_quota {
            return Err(Error::QuotaExceeded {
                used: used + entry_size,
                limit: self.total_quota,
            });
        }
        if !replacing && count + 1 > self.max_items {
            return Err(Error::ItemCountExceeded {
                count: count + 1,
                limit: self.max_items,
            });
        }
        Ok(())
    }

    /// Current syncable-area usage (recomputed on read).
    pub async fn usage(&self) -> Result<QuotaUsage> {
        self.recompute_usage().await
    }

    /// Usage as of the last remote write, without touching storage.
    pub fn cached_usage(&self) -> QuotaUsage {
        *lock(&self.usage)
    }

    async fn recompute_usage(&self) -> Result<QuotaUsage> {
        let mut used_bytes = 0;
        let mut item_count = 0;
        for key in self.sync.keys().await? {
            used_bytes += key.len()
                + self
                    .sync
                    .read(&key)
                    .await?
                    .map(|v| v.len())
                    .unwrap_or(0);
            item_count += 1;
        }

        let usage = QuotaUsage {
            used_bytes,
            total_bytes: self.total_quota,
            item_count,
            max_items: self.max_items,
            near_quota: used_bytes * 10 >= self.total_quota * 8,
            near_item_limit: item_count * 10 >= self.max_items * 9,
        };
        *lock(&self.usage) = usage;
        Ok(usage)
    }
}
