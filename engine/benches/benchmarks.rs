//! Performance benchmarks for stashmark-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use stashmark_engine::{codec, merge, Folder, SavedSearch, SyncSnapshot, TradeLocation};

fn build_snapshot(folders: usize, trades_per_folder: usize) -> SyncSnapshot {
    let mut snapshot = SyncSnapshot::new();
    for f in 0..folders {
        let folder_id = format!("folder_{f}");
        snapshot.add_folder(Folder::with_id(folder_id.as_str(), format!("Folder {f}"), 1000));
        for t in 0..trades_per_folder {
            snapshot.add_trade(
                folder_id.as_str(),
                SavedSearch {
                    id: format!("trade_{f}_{t}"),
                    title: format!("Search {t} in folder {f}"),
                    location: TradeLocation {
                        version: "2".into(),
                        search_type: "search".into(),
                        league: "Standard".into(),
                        slug: format!("slug{f}{t}"),
                    },
                    query_payload: json!({"query": {"filters": {"type": {"category": "boots"}}}}),
                    result_count: Some(42),
                    preview_image_url: None,
                    updated_at: 1000 + t as u64,
                },
            );
        }
    }
    snapshot
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for size in [10, 50, 200].iter() {
        group.bench_with_input(BenchmarkId::new("divergent", size), size, |b, &size| {
            let local = build_snapshot(size, 4);
            // Remote overlaps half the folders with newer stamps
            let mut remote = build_snapshot(size / 2, 4);
            for folder in &mut remote.folders {
                folder.updated_at = 2000;
            }

            b.iter(|| merge(black_box(&local), black_box(&remote), black_box(5000)))
        });

        group.bench_with_input(BenchmarkId::new("identical", size), size, |b, &size| {
            let snapshot = build_snapshot(size, 4);
            b.iter(|| merge(black_box(&snapshot), black_box(&snapshot), black_box(5000)))
        });
    }

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for size in [10, 50, 200].iter() {
        group.bench_with_input(BenchmarkId::new("compress", size), size, |b, &size| {
            let snapshot = build_snapshot(size, 4);
            b.iter(|| codec::compress(black_box(&snapshot)))
        });

        group.bench_with_input(BenchmarkId::new("decompress", size), size, |b, &size| {
            let packed = codec::compress(&build_snapshot(size, 4)).unwrap();
            b.iter(|| codec::decompress(black_box(&packed)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_merge, bench_codec);
criterion_main!(benches);
