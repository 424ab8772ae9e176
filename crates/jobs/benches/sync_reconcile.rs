use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use caseflow_core::{EntityId, TenantId};
use caseflow_jobs::{ExternalRecord, IncrementalSync, InMemoryRecordStore, SyncMode};
use chrono::{Duration, TimeZone, Utc};

fn records(n: usize) -> Vec<ExternalRecord> {
    let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| ExternalRecord {
            code: format!("{}", 100 + i % 50),
            occurred_at: start + Duration::minutes(i as i64),
            description: format!("movement {i}"),
            raw: serde_json::json!({ "seq": i }),
        })
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

/// Steady state: upstream unchanged, every record already known.
fn bench_reconcile_unchanged(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("reconcile_unchanged");

    for size in [10usize, 100, 1000] {
        let store = InMemoryRecordStore::arc();
        let sync = IncrementalSync::new(store);
        let tenant = TenantId::new();
        let entity = EntityId::new();
        let fetched = records(size);
        rt.block_on(sync.reconcile(tenant, entity, fetched.clone(), Utc::now()))
            .unwrap();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &fetched, |b, fetched| {
            b.to_async(&rt).iter(|| async {
                let report = sync
                    .reconcile(tenant, entity, black_box(fetched.clone()), Utc::now())
                    .await
                    .unwrap();
                black_box(report)
            });
        });
    }

    group.finish();
}

/// Incremental vs replace when only the newest record is unseen.
fn bench_mode_comparison(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("reconcile_one_new_record");
    let size = 500;
    let fetched = records(size);

    for mode in [SyncMode::Incremental, SyncMode::Replace] {
        group.bench_function(format!("{mode:?}"), |b| {
            b.to_async(&rt).iter(|| async {
                let store = InMemoryRecordStore::arc();
                let sync = IncrementalSync::new(store).with_mode(mode);
                let tenant = TenantId::new();
                let entity = EntityId::new();
                sync.reconcile(tenant, entity, fetched[..size - 1].to_vec(), Utc::now())
                    .await
                    .unwrap();
                let report = sync
                    .reconcile(tenant, entity, black_box(fetched.clone()), Utc::now())
                    .await
                    .unwrap();
                black_box(report)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_reconcile_unchanged, bench_mode_comparison);
criterion_main!(benches);
