use criterion::{criterion_group, criterion_main, Criterion};
use std::time::Instant;
use union_table::UnionTable;

const SIZE: usize = 4099;

fn acquire(c: &mut Criterion) {
    c.bench_function("UnionTable: acquire", |b| {
        b.iter_custom(|iters| {
            let table: UnionTable<u64, SIZE> = UnionTable::new();
            let start = Instant::now();
            for i in 1..=iters {
                let mut handle = table.acquire(i);
                if handle.created() {
                    *handle = i;
                }
            }
            start.elapsed()
        })
    });
}

fn lookup_embedded(c: &mut Criterion) {
    c.bench_function("UnionTable: lookup_embedded", |b| {
        b.iter_custom(|iters| {
            let table: UnionTable<u64, SIZE> = UnionTable::new();
            let num_keys = SIZE as u64;
            for i in 1..=num_keys {
                *table.acquire(i) = i;
            }
            let start = Instant::now();
            for i in 0..iters {
                let key = i % num_keys + 1;
                assert_eq!(table.get(key), Some(key));
            }
            start.elapsed()
        })
    });
}

fn lookup_overflow(c: &mut Criterion) {
    c.bench_function("UnionTable: lookup_overflow", |b| {
        b.iter_custom(|iters| {
            let table: UnionTable<u64, 7> = UnionTable::new();
            let num_keys = 1024;
            for i in 1..=num_keys {
                *table.acquire(i) = i;
            }
            let start = Instant::now();
            for i in 0..iters {
                let key = i % num_keys + 1;
                assert_eq!(table.get(key), Some(key));
            }
            start.elapsed()
        })
    });
}

fn get_or_insert_with(c: &mut Criterion) {
    c.bench_function("UnionTable: get_or_insert_with", |b| {
        b.iter_custom(|iters| {
            let table: UnionTable<u64, SIZE> = UnionTable::new();
            let start = Instant::now();
            for i in 0..iters {
                let key = i % 8192 + 1;
                assert_eq!(table.get_or_insert_with(key, || key * 2), key * 2);
            }
            start.elapsed()
        })
    });
}

fn remove_reinsert(c: &mut Criterion) {
    c.bench_function("UnionTable: remove_reinsert", |b| {
        b.iter_custom(|iters| {
            let table: UnionTable<u64, SIZE> = UnionTable::new();
            let num_keys = 8192;
            for i in 1..=num_keys {
                *table.acquire(i) = i;
            }
            let start = Instant::now();
            for i in 0..iters {
                let key = i % num_keys + 1;
                assert_eq!(unsafe { table.remove(key) }, Some(key));
                *table.acquire(key) = key;
            }
            start.elapsed()
        })
    });
}

criterion_group!(
    benches,
    acquire,
    lookup_embedded,
    lookup_overflow,
    get_or_insert_with,
    remove_reinsert
);
criterion_main!(benches);
