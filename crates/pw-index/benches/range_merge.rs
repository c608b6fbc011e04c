//! Benchmark: interval merge under sequential and scattered add streams.
//!
//! Sequential readahead produces adjacent intervals that collapse into one
//! range; scattered faults grow the range set and exercise the binary
//! search + outward walk.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use pw_index::DeviceTable;
use pw_types::{Dev, InodeNumber};

fn sequential_adds(n: u64) -> DeviceTable {
    let mut table = DeviceTable::new();
    for i in 0..n {
        table.add(Dev::new(8, 0), InodeNumber(1), i * 4, i * 4 + 3);
    }
    table
}

/// Fixed-seed LCG so every run sees the same scattered stream.
fn scattered_intervals(n: usize) -> Vec<(u64, u64)> {
    let mut state = 0x9E37_79B9_7F4A_7C15_u64;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        let first = (state >> 33) % 100_000;
        out.push((first, first + 7));
    }
    out
}

fn bench_sequential(c: &mut Criterion) {
    c.bench_function("add_sequential_4k", |b| {
        b.iter(|| black_box(sequential_adds(black_box(4096))));
    });
}

fn bench_scattered(c: &mut Criterion) {
    let intervals = scattered_intervals(4096);

    c.bench_function("add_scattered_4k", |b| {
        b.iter(|| {
            let mut table = DeviceTable::new();
            for &(first, last) in &intervals {
                table.add(Dev::new(8, 0), InodeNumber(1), first, last);
            }
            black_box(table)
        });
    });
}

fn bench_find(c: &mut Criterion) {
    let table = sequential_adds(4096);

    c.bench_function("find_hot_inode", |b| {
        b.iter(|| black_box(table.find(Dev::new(8, 0), InodeNumber(1))));
    });
}

criterion_group!(benches, bench_sequential, bench_scattered, bench_find);
criterion_main!(benches);
