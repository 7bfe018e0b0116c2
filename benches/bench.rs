use std::sync::Mutex;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use durian::HashMap;

const SIZE: u64 = 10_000;

// A baseline with the same key space for rough comparison.
fn mutex_std(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutex-std");

    let map = Mutex::new(std::collections::HashMap::<u64, u64>::new());
    for i in 1..=SIZE {
        map.lock().unwrap().insert(i << 3, i << 3);
    }

    group.bench_function("get", |b| {
        let mut i = 1;
        b.iter(|| {
            let value = map.lock().unwrap().get(&black_box((i % SIZE + 1) << 3)).copied();
            black_box(value);
            i += 1;
        });
    });

    group.bench_function("overwrite", |b| {
        let mut i = 1;
        b.iter(|| {
            map.lock().unwrap().insert((i % SIZE + 1) << 3, (i % 97 + 1) << 3);
            i += 1;
        });
    });

    group.finish();
}

fn compare(c: &mut Criterion) {
    let mut group = c.benchmark_group("durian");

    let dir = tempfile::TempDir::new().unwrap();
    let map = HashMap::builder(dir.path().join("map"))
        .capacity(1 << 15)
        .build()
        .unwrap();
    for i in 1..=SIZE {
        map.insert(i << 3, i << 3).unwrap();
    }

    group.bench_function("get", |b| {
        let mut i = 1;
        b.iter(|| {
            let value = map.get(black_box((i % SIZE + 1) << 3)).unwrap();
            black_box(value);
            i += 1;
        });
    });

    group.bench_function("overwrite", |b| {
        let mut i = 1;
        b.iter(|| {
            map.insert((i % SIZE + 1) << 3, (i % 97 + 1) << 3).unwrap();
            i += 1;
        });
    });

    group.bench_function("increment", |b| {
        b.iter(|| {
            map.update(8, 1 << 3, durian::ops::add).unwrap();
        });
    });

    group.bench_function("insert_fresh", |b| {
        let dir = tempfile::TempDir::new().unwrap();
        let map = HashMap::builder(dir.path().join("map"))
            .capacity(1 << 20)
            .build()
            .unwrap();
        let mut i = 1u64;
        b.iter(|| {
            map.insert(i << 3, i << 3).unwrap();
            i += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, compare, mutex_std);
criterion_main!(benches);
