//! State codec: one snapshot in, one compact transport-safe string out.
//!
//! The remote store is tiny (tens of kilobytes), so the full replicable state
//! is DEFLATE-compressed and base64-encoded (URL-safe, unpadded) before it is
//! written. Decompression of malformed or truncated input returns `None`,
//! never an error, so callers treat "no valid remote data" uniformly with
//! "no remote data at all."

use crate::error::Result;
use crate::{Error, SyncSnapshot};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Serialize and compress a snapshot into a transport-safe string.
pub fn compress(snapshot: &SyncSnapshot) -> Result<String> {
    let json = serde_json::to_vec(snapshot)?;

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(&json)
        .and_then(|()| encoder.finish())
        .map(|bytes| URL_SAFE_NO_PAD.encode(bytes))
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// Decompress a string produced by [`compress`].
///
/// Any failure (bad base64, corrupt deflate stream, unparseable JSON) yields
/// `None`; a previous version's record format or a partial remote write must
/// never brick sync.
pub fn decompress(raw: &str) -> Option<SyncSnapshot> {
    let compressed = URL_SAFE_NO_PAD.decode(raw).ok()?;

    let mut json = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .ok()?;

    serde_json::from_slice(&json).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Folder, SavedSearch, Tombstone, TradeLocation};
    use serde_json::json;

    fn sample_snapshot() -> SyncSnapshot {
        let mut snapshot = SyncSnapshot::new();
        snapshot.add_folder(Folder::with_id("f1", "Gear", 100));
        snapshot.add_trade(
            "f1",
            SavedSearch {
                id: "t1".into(),
                title: "Boots 30% MS".into(),
                location: TradeLocation {
                    version: "2".into(),
                    search_type: "search".into(),
                    league: "Standard".into(),
                    slug: "abc".into(),
                },
                query_payload: json!({"query": {"filters": {"misc": {"ms": {"min": 30}}}}}),
                result_count: Some(12),
                preview_image_url: None,
                updated_at: 100,
            },
        );
        snapshot.tombstones.push(Tombstone::bookmark("t0", 50));
        snapshot.last_synced_at = 1000;
        snapshot
    }

    #[test]
    fn roundtrip() {
        let snapshot = sample_snapshot();
        let packed = compress(&snapshot).unwrap();
        let unpacked = decompress(&packed).unwrap();
        assert_eq!(unpacked, snapshot);
    }

    #[test]
    fn output_is_url_component_safe() {
        let packed = compress(&sample_snapshot()).unwrap();
        assert!(packed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn malformed_input_returns_none() {
        assert_eq!(decompress(""), None);
        assert_eq!(decompress("!!!not base64!!!"), None);
        assert_eq!(decompress("dmFsaWQgYjY0IGJ1dCBub3QgZGVmbGF0ZQ"), None);
    }

    #[test]
    fn truncated_input_returns_none() {
        let packed = compress(&sample_snapshot()).unwrap();
        let truncated = &packed[..packed.len() / 2];
        assert_eq!(decompress(truncated), None);
    }

    #[test]
    fn compression_actually_shrinks_repetitive_state() {
        let mut snapshot = SyncSnapshot::new();
        for i in 0..50 {
            snapshot.add_folder(Folder::with_id(format!("f{i}"), "Duplicate title", 100));
        }
        let json_len = serde_json::to_vec(&snapshot).unwrap().len();
        let packed = compress(&snapshot).unwrap();
        assert!(packed.len() < json_len);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_timestamp() -> impl Strategy<Value = u64> {
            0u64..10_000_000_000_000
        }

        fn arb_folder() -> impl Strategy<Value = Folder> {
            (
                "[a-z0-9-]{1,12}",
                ".{0,24}",
                proptest::option::of(arb_timestamp()),
                arb_timestamp(),
            )
                .prop_map(|(id, title, archived_at, updated_at)| Folder {
                    id,
                    title,
                    archived_at,
                    updated_at,
                })
        }

        fn arb_trade() -> impl Strategy<Value = SavedSearch> {
            (
                "[a-z0-9-]{1,12}",
                ".{0,24}",
                proptest::option::of(0u64..100_000),
                arb_timestamp(),
            )
                .prop_map(|(id, title, result_count, updated_at)| SavedSearch {
                    id,
                    title,
                    location: TradeLocation {
                        version: "2".into(),
                        search_type: "search".into(),
                        league: "Standard".into(),
                        slug: "slug".into(),
                    },
                    query_payload: json!({"query": {"term": "x"}}),
                    result_count,
                    preview_image_url: None,
                    updated_at,
                })
        }

        fn arb_snapshot() -> impl Strategy<Value = SyncSnapshot> {
            (
                proptest::collection::vec(arb_folder(), 0..8),
                proptest::collection::btree_map(
                    "[a-z0-9-]{1,8}",
                    proptest::collection::vec(arb_trade(), 0..4),
                    0..4,
                ),
                proptest::collection::vec(
                    ("[a-z0-9-]{1,12}", arb_timestamp()).prop_map(|(id, at)| {
                        Tombstone::bookmark(id, at)
                    }),
                    0..4,
                ),
                arb_timestamp(),
            )
                .prop_map(|(folders, trades, tombstones, last_synced_at)| SyncSnapshot {
                    folders,
                    trades,
                    tombstones,
                    last_synced_at,
                })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(1000))]

            #[test]
            fn prop_roundtrip(snapshot in arb_snapshot()) {
                let packed = compress(&snapshot).unwrap();
                prop_assert_eq!(decompress(&packed), Some(snapshot));
            }

            #[test]
            fn prop_output_transport_safe(snapshot in arb_snapshot()) {
                let packed = compress(&snapshot).unwrap();
                prop_assert!(packed
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
            }
        }
    }
}
