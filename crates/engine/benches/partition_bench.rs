use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use engine::{
    EngineConfig, EngineContext, Partition, Record, Sha1Hash, Table, TableStorage,
};
use msg::{FieldType, MessageObject, MessageSchema, Value};
use std::sync::Arc;
use tempfile::tempdir;

const N_RECORDS: usize = 10_000;
const NAME_SIZE: usize = 100;

fn table() -> Arc<Table> {
    let mut schema = MessageSchema::new("bench");
    schema
        .add_field(1, "name", FieldType::String, false, false)
        .add_field(2, "value", FieldType::UInt64, false, true);
    Arc::new(Table::new("bench", "bench", schema, TableStorage::Lsm))
}

fn build_records(schema: &MessageSchema, version: u64) -> Vec<Record> {
    (0..N_RECORDS)
        .map(|i| {
            let mut obj = MessageObject::new();
            obj.push(1, Value::String(vec![b'x'; NAME_SIZE]));
            obj.push(2, Value::UInt64(i as u64));
            let id = Sha1Hash::compute(format!("record{}", i));
            Record::new(id, version, msg::encode(&obj, schema).unwrap())
        })
        .collect()
}

fn config() -> EngineConfig {
    EngineConfig {
        fsync: false,
        ..EngineConfig::default()
    }
    .with_compaction_limits(100, 100)
}

fn open_partition(db: &std::path::Path) -> (Arc<Partition>, Arc<Table>) {
    let table = table();
    let ctx = EngineContext::new(config());
    let p = Partition::create(table.clone(), Sha1Hash::compute("bench"), db, &ctx).unwrap();
    (p, table)
}

fn insert_and_commit_benchmark(c: &mut Criterion) {
    c.bench_function("partition_insert_commit_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let (p, table) = open_partition(dir.path());
                let records = build_records(&table.schema(), 1);
                (dir, p, records)
            },
            |(_dir, p, records)| {
                p.writer().insert_records(records).unwrap();
                p.writer().commit().unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn lookup_benchmark(c: &mut Criterion) {
    c.bench_function("partition_lookup_committed_100", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let (p, table) = open_partition(dir.path());
                p.writer()
                    .insert_records(build_records(&table.schema(), 1))
                    .unwrap();
                p.writer().commit().unwrap();
                let reader = p.lsm_reader().unwrap();
                (dir, reader)
            },
            |(_dir, reader)| {
                for i in 0..100 {
                    let id = Sha1Hash::compute(format!("record{}", i * 97));
                    assert!(reader.lookup(&id).unwrap().is_some());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

fn compaction_benchmark(c: &mut Criterion) {
    c.bench_function("partition_compact_2x10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let (p, table) = open_partition(dir.path());
                for version in 1..=2 {
                    p.writer()
                        .insert_records(build_records(&table.schema(), version))
                        .unwrap();
                    p.writer().commit().unwrap();
                }
                (dir, p)
            },
            |(_dir, p)| {
                let strategy = engine::SimpleCompactionStrategy::new(
                    p.table().clone(),
                    p.base_path(),
                    Arc::new(lsmidx::IndexCache::new()),
                    1,
                    100,
                );
                let mut out = Vec::new();
                let input = p.snapshot().state.lsm_tables.clone();
                engine::CompactionStrategy::compact(&strategy, &input, &mut out).unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    insert_and_commit_benchmark,
    lookup_benchmark,
    compaction_benchmark
);
criterion_main!(benches);
