use anyhow::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::*;
use msg::{FieldType, MessageObject, MessageSchema, Value};

pub const NAMESPACE: &str = "metrics";
pub const TABLE: &str = "events";

/// `events { 1: name string, 2: value uint64 optional }`
pub fn test_schema() -> MessageSchema {
    let mut schema = MessageSchema::new(TABLE);
    schema
        .add_field(1, "name", FieldType::String, false, false)
        .add_field(2, "value", FieldType::UInt64, false, true);
    schema
}

pub fn lsm_table() -> Arc<Table> {
    Arc::new(Table::new(NAMESPACE, TABLE, test_schema(), TableStorage::Lsm))
}

pub fn static_table() -> Arc<Table> {
    Arc::new(Table::new(NAMESPACE, TABLE, test_schema(), TableStorage::Static))
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        fsync: false,
        ..EngineConfig::default()
    }
}

pub fn partition_key() -> Sha1Hash {
    Sha1Hash::compute("partition-0")
}

pub fn payload(name: &str, value: u64) -> Vec<u8> {
    let mut obj = MessageObject::new();
    obj.push(1, Value::String(name.as_bytes().to_vec()));
    obj.push(2, Value::UInt64(value));
    msg::encode(&obj, &test_schema()).expect("test payload encodes")
}

pub fn id(name: &str) -> RecordId {
    Sha1Hash::compute(name)
}

/// A record whose payload carries its own name and version.
pub fn record(name: &str, version: u64) -> Record {
    Record::new(id(name), version, payload(name, version))
}

pub fn create_partition(
    db: &Path,
    config: EngineConfig,
) -> Result<(Arc<Partition>, EngineContext)> {
    let ctx = EngineContext::new(config);
    let partition = Partition::create(lsm_table(), partition_key(), db, &ctx)?;
    Ok((partition, ctx))
}

pub fn insert(partition: &Partition, records: &[(&str, u64)]) -> Result<usize> {
    let batch = records.iter().map(|(n, v)| record(n, *v)).collect();
    Ok(partition.writer().insert_records(batch)?.len())
}

/// Live `(version, payload)` per id as seen by a fresh reader.
pub fn read_all(partition: &Partition) -> Result<BTreeMap<RecordId, (u64, Vec<u8>)>> {
    let mut out = BTreeMap::new();
    partition.lsm_reader()?.fetch_records(|r| {
        assert!(
            out.insert(r.record_id, (r.version, r.payload.clone())).is_none(),
            "record {} yielded twice",
            r.record_id
        );
        Ok(())
    })?;
    Ok(out)
}

pub fn count_files(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|x| x == ext)
                .unwrap_or(false)
        })
        .count()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records every call, optionally failing for some addresses.
#[derive(Default)]
pub struct RecordingTransport {
    pub batches: Mutex<Vec<(String, RecordEnvelopeList)>>,
    pub tables: Mutex<Vec<(String, u64, Vec<u8>)>>,
    pub info: Mutex<Option<PartitionInfo>>,
    failing: HashSet<String>,
}

impl RecordingTransport {
    pub fn failing(addrs: &[&str]) -> Self {
        Self {
            failing: addrs.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    fn check(&self, addr: &str) -> Result<()> {
        if self.failing.contains(addr) {
            return Err(PartitionError::Replication {
                addr: addr.to_string(),
                status: 503,
                body: "unavailable".to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn batch_sizes(&self, addr: &str) -> Vec<usize> {
        self.batches
            .lock()
            .iter()
            .filter(|(a, _)| a == addr)
            .map(|(_, b)| b.len())
            .collect()
    }
}

impl ReplicaTransport for RecordingTransport {
    fn upload_batch(&self, addr: &str, batch: &RecordEnvelopeList) -> Result<()> {
        self.check(addr)?;
        // Exercise the wire encoding.
        let decoded = RecordEnvelopeList::decode(&batch.encode()?)?;
        self.batches.lock().push((addr.to_string(), decoded));
        Ok(())
    }

    fn partition_info(
        &self,
        addr: &str,
        _partition: PartitionAddr<'_>,
    ) -> Result<Option<PartitionInfo>> {
        self.check(addr)?;
        Ok(self.info.lock().clone())
    }

    fn upload_table(
        &self,
        addr: &str,
        _partition: PartitionAddr<'_>,
        version: u64,
        data: Vec<u8>,
    ) -> Result<()> {
        self.check(addr)?;
        self.tables.lock().push((addr.to_string(), version, data));
        Ok(())
    }
}
