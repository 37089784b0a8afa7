//! Merge engine: folds a local and a remote snapshot into a converged one.
//!
//! This is a pure function of its inputs (the caller passes `now` for
//! tombstone pruning), so merges are deterministic and auditable. Conflict
//! resolution is whole-record last-write-wins on `updated_at`: the record
//! kinds are small and user edits are atomic, so replacement cannot silently
//! lose a concurrent edit to a *different* record - only to the same record
//! edited on two devices inside one sync interval, which is an accepted
//! tradeoff.
//!
//! # Algorithm, per collection (folders, and trades per folder id)
//!
//! 1. Union both tombstone sets (dedupe by id, newest `deleted_at` wins),
//!    prune entries older than the retention window.
//! 2. For every id on either side:
//!    a. an applicable tombstone newer than both sides drops the id;
//!    b. present on both sides: larger `updated_at` wins, ties keep local;
//!    c. local only: keep as-is;
//!    d. remote only: keep, and flag `has_new_external_data`.
//! 3. A folder whose merged trade list is empty is omitted from the map.

use crate::{Folder, SavedSearch, SyncSnapshot, Timestamp, Tombstone, TombstoneKind};
use std::collections::{BTreeMap, BTreeSet};

/// How long a tombstone keeps suppressing resurrections: 30 days.
///
/// Past the window suppression is no longer guaranteed; this bounds tombstone
/// growth at the cost of a theoretical resurrection risk beyond it.
pub const TOMBSTONE_RETENTION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Result of a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The converged snapshot
    pub snapshot: SyncSnapshot,
    /// True when the remote side contributed a record not previously known
    /// locally and not an acknowledged deletion, i.e. it arrived from another
    /// device or session
    pub has_new_external_data: bool,
}

/// Anything the merge can order by id and mutation stamp.
trait Replicated: Clone {
    fn record_id(&self) -> &str;
    fn stamp(&self) -> Timestamp;
}

impl Replicated for Folder {
    fn record_id(&self) -> &str {
        &self.id
    }
    fn stamp(&self) -> Timestamp {
        self.updated_at
    }
}

impl Replicated for SavedSearch {
    fn record_id(&self) -> &str {
        &self.id
    }
    fn stamp(&self) -> Timestamp {
        self.updated_at
    }
}

/// Merge two snapshots into a converged one, with the default tombstone
/// retention window.
pub fn merge(local: &SyncSnapshot, remote: &SyncSnapshot, now: Timestamp) -> MergeOutcome {
    merge_with_retention(local, remote, now, TOMBSTONE_RETENTION_MS)
}

/// Merge with an explicit retention window (test and configuration hook).
pub fn merge_with_retention(
    local: &SyncSnapshot,
    remote: &SyncSnapshot,
    now: Timestamp,
    retention_ms: u64,
) -> MergeOutcome {
    let tombstones = union_tombstones(&local.tombstones, &remote.tombstones, now, retention_ms);

    let folder_graves = graves_of_kind(&tombstones, TombstoneKind::Folder);
    let trade_graves = graves_of_kind(&tombstones, TombstoneKind::Bookmark);

    let mut has_new_external_data = false;

    let folders = merge_collection(
        &local.folders,
        &remote.folders,
        &folder_graves,
        &mut has_new_external_data,
    );

    // Trades merge independently within each folder id found on either side.
    // A group whose parent folder is gone is carried transiently (it is never
    // surfaced in listings) rather than dropped here.
    let folder_ids: BTreeSet<&String> = local.trades.keys().chain(remote.trades.keys()).collect();

    let empty: Vec<SavedSearch> = Vec::new();
    let mut trades = BTreeMap::new();
    for folder_id in folder_ids {
        let merged = merge_collection(
            local.trades.get(folder_id).unwrap_or(&empty),
            remote.trades.get(folder_id).unwrap_or(&empty),
            &trade_graves,
            &mut has_new_external_data,
        );
        if !merged.is_empty() {
            trades.insert(folder_id.clone(), merged);
        }
    }

    MergeOutcome {
        snapshot: SyncSnapshot {
            folders,
            trades,
            tombstones,
            last_synced_at: local.last_synced_at.max(remote.last_synced_at),
        },
        has_new_external_data,
    }
}

/// Union both tombstone sets, keeping the newest `deleted_at` per id, then
/// prune entries older than the retention window relative to `now`.
fn union_tombstones(
    local: &[Tombstone],
    remote: &[Tombstone],
    now: Timestamp,
    retention_ms: u64,
) -> Vec<Tombstone> {
    let mut by_id: BTreeMap<&str, &Tombstone> = BTreeMap::new();
    for tombstone in local.iter().chain(remote) {
        by_id
            .entry(&tombstone.id)
            .and_modify(|kept| {
                if tombstone.deleted_at > kept.deleted_at {
                    *kept = tombstone;
                }
            })
            .or_insert(tombstone);
    }

    by_id
        .into_values()
        .filter(|t| now.saturating_sub(t.deleted_at) <= retention_ms)
        .cloned()
        .collect()
}

fn graves_of_kind(tombstones: &[Tombstone], kind: TombstoneKind) -> BTreeMap<&str, Timestamp> {
    tombstones
        .iter()
        .filter(|t| t.kind == kind)
        .map(|t| (t.id.as_str(), t.deleted_at))
        .collect()
}

/// Merge one record collection. Output order is local order first, with
/// remote-only records appended; ordering is not a replicated invariant,
/// only the record sets converge.
fn merge_collection<T: Replicated>(
    local: &[T],
    remote: &[T],
    graves: &BTreeMap<&str, Timestamp>,
    has_new_external_data: &mut bool,
) -> Vec<T> {
    let remote_by_id: BTreeMap<&str, &T> = remote.iter().map(|r| (r.record_id(), r)).collect();
    let local_ids: BTreeSet<&str> = local.iter().map(|r| r.record_id()).collect();

    let mut merged = Vec::new();

    for record in local {
        let counterpart = remote_by_id.get(record.record_id()).copied();
        let newest = record
            .stamp()
            .max(counterpart.map(Replicated::stamp).unwrap_or(0));

        if is_suppressed(graves, record.record_id(), newest) {
            continue;
        }

        // Last-write-wins; ties keep the local copy since local already
        // reflects the latest user-visible state in this process.
        match counterpart {
            Some(remote_record) if remote_record.stamp() > record.stamp() => {
                merged.push(remote_record.clone());
            }
            _ => merged.push(record.clone()),
        }
    }

    for record in remote {
        if local_ids.contains(record.record_id()) {
            continue;
        }
        if is_suppressed(graves, record.record_id(), record.stamp()) {
            continue;
        }
        merged.push(record.clone());
        *has_new_external_data = true;
    }

    merged
}

fn is_suppressed(graves: &BTreeMap<&str, Timestamp>, id: &str, newest_stamp: Timestamp) -> bool {
    graves
        .get(id)
        .is_some_and(|deleted_at| *deleted_at > newest_stamp)
}
