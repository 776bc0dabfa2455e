//! Translation throughput benchmarks
//!
//! Measures point updates and lookups through the full stack (tree descent,
//! page cache, log-structured store, file-backed flash).

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flashmap::{Config, MappingTable};
use tempfile::tempdir;

fn bench_updates(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("bench.dbf"), 64, 64, 10, true);
    let mut table = MappingTable::open(config).unwrap();

    let mut group = c.benchmark_group("update");
    group.throughput(Throughput::Elements(1));
    group.bench_function("point_update", |b| {
        let mut logical = 0u64;
        let mut physical = 1u64;
        b.iter(|| {
            table.update(black_box(logical), black_box(physical)).unwrap();
            logical = (logical + 1) % 64;
            physical = physical.wrapping_add(0x9E37_79B9);
        });
    });
    group.finish();
}

fn bench_lookups(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("bench.dbf"), 64, 64, 10, true);
    let mut table = MappingTable::open(config).unwrap();
    for i in 0..64u64 {
        table.update(i, 1000 * i + 42).unwrap();
    }

    let mut group = c.benchmark_group("lookup");
    group.throughput(Throughput::Elements(1));
    group.bench_function("point_lookup", |b| {
        let mut logical = 0u64;
        b.iter(|| {
            let physical = table.lookup(black_box(logical)).unwrap();
            black_box(physical);
            logical = (logical + 1) % 64;
        });
    });
    group.finish();
}

criterion_group!(benches, bench_updates, bench_lookups);
criterion_main!(benches);
