use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata::btree::BPlusTree;
use strata::{Engine, EngineConfig, IsolationLevel, Uid, PAGE_SIZE};
use tempfile::TempDir;

fn setup_engine() -> (TempDir, Engine, Vec<Uid>) {
    let temp_dir = TempDir::new().unwrap();
    let config = EngineConfig::new(temp_dir.path().join("bench"))
        .with_memory((PAGE_SIZE * 1024) as u64);
    let engine = Engine::create(config).unwrap();

    let xid = engine.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    let uids = (0..1000)
        .map(|i| {
            engine
                .insert_record(xid, format!("record {i}").as_bytes())
                .unwrap()
        })
        .collect();
    engine.commit(xid).unwrap();

    (temp_dir, engine, uids)
}

fn benchmark_insert(c: &mut Criterion) {
    let (_dir, engine, _) = setup_engine();
    let payload = vec![7u8; 64];

    c.bench_function("insert_record", |b| {
        b.iter(|| {
            let xid = engine.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
            let uid = engine.insert_record(xid, black_box(&payload)).unwrap();
            engine.commit(xid).unwrap();
            uid
        })
    });
}

fn benchmark_read(c: &mut Criterion) {
    let (_dir, engine, uids) = setup_engine();

    c.bench_function("read_record_rr", |b| {
        b.iter(|| {
            let xid = engine.begin_transaction(IsolationLevel::RepeatableRead).unwrap();
            let mut total = 0;
            for &uid in uids.iter().step_by(10) {
                total += engine.read_record(xid, black_box(uid)).unwrap().map_or(0, |d| d.len());
            }
            engine.commit(xid).unwrap();
            total
        })
    });
}

fn benchmark_index_search(c: &mut Criterion) {
    let (_dir, engine, uids) = setup_engine();
    let boot_uid = engine.create_index().unwrap();
    let tree: BPlusTree = engine.load_index(boot_uid).unwrap();
    for (key, &uid) in uids.iter().enumerate() {
        tree.insert(key as i64, uid).unwrap();
    }

    c.bench_function("index_search_range", |b| {
        b.iter(|| tree.search_range(black_box(100), black_box(200)).unwrap())
    });
}

criterion_group!(benches, benchmark_insert, benchmark_read, benchmark_index_search);
criterion_main!(benches);
