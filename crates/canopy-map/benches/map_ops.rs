use canopy_map::{merge_left, PersistentIntMap, SkipMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    for size in [1_000u64, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::new("PersistentIntMap", size), &size, |b, &size| {
            let mut rng = SmallRng::seed_from_u64(1);
            b.iter(|| {
                let mut map = PersistentIntMap::new();
                for _ in 0..size {
                    map.insert_or_replace(rng.gen::<u64>() >> 16, 1u64);
                }
                black_box(map.len())
            });
        });
        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &size, |b, &size| {
            let mut rng = SmallRng::seed_from_u64(1);
            b.iter(|| {
                let mut map = BTreeMap::new();
                for _ in 0..size {
                    map.insert(rng.gen::<u64>() >> 16, 1u64);
                }
                black_box(map.len())
            });
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut rng = SmallRng::seed_from_u64(2);
    let mut map = PersistentIntMap::new();
    let keys: Vec<u64> = (0..100_000).map(|_| rng.gen::<u64>() >> 16).collect();
    for &key in &keys {
        map.insert_or_replace(key, key);
    }
    c.bench_function("lookup/PersistentIntMap", |b| {
        let mut index = 0usize;
        b.iter(|| {
            index = (index + 1) % keys.len();
            black_box(map.get(keys[index]))
        });
    });
}

fn bench_merge(c: &mut Criterion) {
    let mut rng = SmallRng::seed_from_u64(3);
    let mut a = PersistentIntMap::new();
    let mut b_map = PersistentIntMap::new();
    for _ in 0..50_000 {
        a.insert_or_replace(rng.gen::<u64>() >> 20, 1u64);
        b_map.insert_or_replace(rng.gen::<u64>() >> 20, 2u64);
    }
    c.bench_function("merge_left/50k_x_50k", |b| {
        b.iter(|| black_box(merge_left(&a, &b_map).len()));
    });
}

fn bench_skiplist_emplace(c: &mut Criterion) {
    c.bench_function("skiplist_emplace/10k", |b| {
        let mut rng = SmallRng::seed_from_u64(4);
        b.iter(|| {
            let map = SkipMap::new();
            for _ in 0..10_000 {
                map.emplace(rng.gen::<u64>() >> 16, 1u64);
            }
            black_box(map.freeze().iter().count())
        });
    });
}

criterion_group!(
    benches,
    bench_insert,
    bench_lookup,
    bench_merge,
    bench_skiplist_emplace
);
criterion_main!(benches);
