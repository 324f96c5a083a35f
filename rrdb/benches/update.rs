//! Microbenchmarks for the `update()` path.
//!
//! Measures per-sample latency on the memory-mapped and in-memory backends,
//! and the cost of a long gap going through the bulk fill.
//!
//! Run with: `cargo bench -p rrdb -- update`

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rrdb::{ConsolFun, DsType, FactoryRegistry, RrdDb, RrdDef};
use tempfile::tempdir;

const STEP: i64 = 1;

/// A definition shaped like a typical host metrics file.
fn def(id: &str, ds_count: usize) -> RrdDef {
    let mut def = RrdDef::new(id, 0, STEP).unwrap();
    for i in 0..ds_count {
        def.add_datasource_with(&format!("ds{i}"), DsType::Gauge, 2, f64::NAN, f64::NAN)
            .unwrap();
    }
    def.add_archive_with(ConsolFun::Average, 0.5, 1, 3_600).unwrap();
    def.add_archive_with(ConsolFun::Average, 0.5, 60, 1_440).unwrap();
    def.add_archive_with(ConsolFun::Max, 0.5, 60, 1_440).unwrap();
    def
}

fn bench_update_backends(c: &mut Criterion) {
    let mut group = c.benchmark_group("update/backend");
    let dir = tempdir().unwrap();
    let registry = FactoryRegistry::default();

    let ids = [
        ("mmap", format!("mmap:{}", dir.path().join("bench.rrd").display())),
        ("memory", "memory:bench".to_string()),
    ];
    for (name, id) in &ids {
        let db = RrdDb::create(&def(id, 4), &registry).unwrap();
        let values = [1.0, 2.0, 3.0, 4.0];
        let mut time = 0;

        group.bench_with_input(BenchmarkId::from_parameter(name), name, |b, _| {
            b.iter(|| {
                time += STEP;
                db.update(black_box(time), black_box(&values)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_update_ds_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("update/ds_count");
    let registry = FactoryRegistry::default();

    for count in [1, 10, 30, 100] {
        let db = RrdDb::create(&def(&format!("memory:ds{count}"), count), &registry).unwrap();
        let values = vec![42.5; count];
        let mut time = 0;

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                time += STEP;
                db.update(black_box(time), black_box(&values)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_update_gap(c: &mut Criterion) {
    let registry = FactoryRegistry::default();
    let mut def = def("memory:gap", 1);
    def.datasources[0].heartbeat = 1_000_000;
    let db = RrdDb::create(&def, &registry).unwrap();
    let mut time = 0;

    // Each sample spans a day of primary steps.
    c.bench_function("update/day_gap", |b| {
        b.iter(|| {
            time += 86_400;
            db.update(black_box(time), black_box(&[1.0])).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_update_backends,
    bench_update_ds_count,
    bench_update_gap,
);
criterion_main!(benches);
