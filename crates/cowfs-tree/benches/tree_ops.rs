use criterion::{Criterion, black_box, criterion_group, criterion_main};

use cowfs_tree::mem::MemTreeStore;
use cowfs_tree::{RangeCursor, TreeConfig, insert, lookup, remove};

const PAYLOAD: usize = 4088;

fn key(i: u32) -> Vec<u8> {
    format!("bench-key-{i:08}").into_bytes()
}

fn build(n: u32) -> (MemTreeStore, cowfs_types::BlockAddress) {
    let mut store = MemTreeStore::new(PAYLOAD);
    let cfg = TreeConfig::default();
    let mut root = None;
    for i in 0..n {
        root = Some(insert(&mut store, &cfg, root, &key(i), b"value").expect("insert"));
    }
    (store, root.expect("non-empty"))
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert_10k_sequential", |b| {
        b.iter(|| {
            let (_, root) = build(10_000);
            black_box(root);
        });
    });
}

fn bench_lookup(c: &mut Criterion) {
    let (store, root) = build(10_000);
    c.bench_function("lookup_hit", |b| {
        let mut i = 0_u32;
        b.iter(|| {
            i = (i + 7919) % 10_000;
            black_box(lookup(&store, Some(root), &key(i)).expect("lookup"));
        });
    });
}

fn bench_range(c: &mut Criterion) {
    let (store, root) = build(10_000);
    c.bench_function("range_scan_1k", |b| {
        b.iter(|| {
            let mut cursor = RangeCursor::new(Some(root), &key(4000), Some(&key(5000)), 128);
            let mut total = 0_usize;
            loop {
                let batch = cursor.next_batch(&store).expect("batch");
                if batch.is_empty() {
                    break;
                }
                total += batch.len();
            }
            black_box(total);
        });
    });
}

fn bench_remove(c: &mut Criterion) {
    c.bench_function("remove_1k", |b| {
        b.iter(|| {
            let (mut store, root) = build(1_000);
            let cfg = TreeConfig::default();
            let mut root = Some(root);
            for i in 0..1_000 {
                let (new_root, _) = remove(&mut store, &cfg, root, &key(i)).expect("remove");
                root = new_root;
            }
            black_box(root);
        });
    });
}

criterion_group!(benches, bench_insert, bench_lookup, bench_range, bench_remove);
criterion_main!(benches);
