use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use dpdb::{Db, Value};

fn bench_put(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::builder()
        .path(dir.path().join("bench.dpdb"))
        .locking(false)
        .open()
        .unwrap();
    let root = db.root_map().unwrap();

    let mut i = 0u64;
    c.bench_function("put_scalar", |b| {
        b.iter(|| {
            i += 1;
            root.put(format!("key-{i}").as_bytes(), "a small scalar value")
                .unwrap();
        })
    });
}

fn bench_get(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::builder()
        .path(dir.path().join("bench.dpdb"))
        .locking(false)
        .open()
        .unwrap();
    let root = db.root_map().unwrap();
    for i in 0..10_000u32 {
        root.put(format!("key-{i}").as_bytes(), format!("value-{i}"))
            .unwrap();
    }

    let mut i = 0u32;
    c.bench_function("get_scalar", |b| {
        b.iter(|| {
            i = (i + 7919) % 10_000;
            root.get(format!("key-{i}").as_bytes()).unwrap().unwrap();
        })
    });
}

fn bench_traversal(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::builder()
        .path(dir.path().join("bench.dpdb"))
        .locking(false)
        .open()
        .unwrap();
    let root = db.root_map().unwrap();
    for i in 0..1_000u32 {
        root.put(format!("key-{i}").as_bytes(), "x").unwrap();
    }

    c.bench_function("walk_1k_keys", |b| {
        b.iter(|| {
            assert_eq!(root.keys().unwrap().len(), 1_000);
        })
    });
}

fn bench_transaction(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::builder()
        .path(dir.path().join("bench.dpdb"))
        .locking(false)
        .open()
        .unwrap();
    let root = db.root_map().unwrap();
    root.put(b"k", "base").unwrap();

    c.bench_function("txn_write_commit", |b| {
        b.iter_batched(
            || (),
            |_| {
                db.begin().unwrap();
                root.put(b"k", "inside").unwrap();
                db.commit().unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_nested(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::builder()
        .path(dir.path().join("bench.dpdb"))
        .locking(false)
        .open()
        .unwrap();
    let root = db.root_map().unwrap();

    let mut i = 0u64;
    c.bench_function("put_nested_map", |b| {
        b.iter(|| {
            i += 1;
            root.put(
                format!("m{i}").as_bytes(),
                Value::Map(vec![
                    (b"a".to_vec(), Value::from("1")),
                    (b"b".to_vec(), Value::from("2")),
                ]),
            )
            .unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_put,
    bench_get,
    bench_traversal,
    bench_transaction,
    bench_nested
);
criterion_main!(benches);
