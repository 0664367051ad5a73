//! Benchmarks for compaction throughput.
#![allow(missing_docs)]

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use docstore::config::{DbConfig, FsyncOptions};
use docstore::{Doc, NullNotifier, NullStateSink, UpdaterHandle};
use std::sync::Arc;
use std::time::Duration;

fn bench_config() -> DbConfig {
    DbConfig {
        fsync: FsyncOptions {
            before_header: false,
            after_header: false,
            on_file_open: false,
        },
        ..DbConfig::default()
    }
}

fn populated_db(doc_count: usize) -> (tempfile::TempDir, UpdaterHandle) {
    let tmp = tempfile::tempdir().unwrap();
    let handle = UpdaterHandle::spawn(
        "bench",
        tmp.path().join("bench.db"),
        true,
        bench_config(),
        Arc::new(NullNotifier),
        Arc::new(NullStateSink),
    )
    .unwrap();
    for chunk in (0..doc_count).collect::<Vec<_>>().chunks(500) {
        let docs: Vec<Doc> = chunk
            .iter()
            .map(|i| Doc::new(format!("doc-{i:06}"), format!("body-{i}").into_bytes()))
            .collect();
        handle.update_docs(docs, false, false).unwrap();
    }
    handle.full_commit().unwrap();
    (tmp, handle)
}

fn wait_done(handle: &UpdaterHandle) {
    loop {
        if !handle.compaction_status().unwrap().running {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");
    group.sample_size(10);

    group.bench_function("compact_2k_docs", |b| {
        b.iter_batched(
            || populated_db(2_000),
            |(_tmp, handle)| {
                handle.start_compact().unwrap();
                wait_done(&handle);
                handle.close();
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_compaction);
criterion_main!(benches);
