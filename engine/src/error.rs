//! Error types for the StashMark sync engine.

use crate::{FolderId, TradeId};
use thiserror::Error;

/// All possible errors from the sync engine.
///
/// None of these are fatal to local usage: every failure mode degrades to
/// "still usable locally, sync temporarily stale."
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Quota errors
    #[error("sync quota exceeded: {used} bytes compressed, limit is {limit} - remove some folders or trades to sync")]
    QuotaExceeded { used: usize, limit: usize },

    #[error("record too large to sync: key '{key}' is {size} bytes, per-item limit is {limit}")]
    ItemQuotaExceeded {
        key: String,
        size: usize,
        limit: usize,
    },

    #[error("sync item count exceeded: {count} items, limit is {limit}")]
    ItemCountExceeded { count: usize, limit: usize },

    // Transport and codec errors
    #[error("remote payload could not be decoded")]
    DecodeFailure,

    #[error("storage transport failed: {0}")]
    Transport(String),

    // Migration errors
    #[error("sync migration rejected: {0}")]
    MigrationRejected(String),

    // Record errors
    #[error("folder not found: {0}")]
    FolderNotFound(FolderId),

    #[error("trade not found: {0}")]
    TradeNotFound(TradeId),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl Error {
    /// Bytes over the limit for quota errors, `None` otherwise.
    pub fn excess_bytes(&self) -> Option<usize> {
        match self {
            Error::QuotaExceeded { used, limit } => Some(used.saturating_sub(*limit)),
            Error::ItemQuotaExceeded { size, limit, .. } => Some(size.saturating_sub(*limit)),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
