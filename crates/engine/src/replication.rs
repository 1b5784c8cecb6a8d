//! # Replication
//!
//! Pushes committed partition contents to peer nodes. Each replica has a
//! watermark in the partition's [`ReplicationState`]; a replication pass
//! ships everything above it and advances it on success.
//!
//! Delivery is at-least-once. A failed replica keeps its watermark and is
//! retried from the same offset on the next pass; the receiving partition's
//! insert path drops records it already holds at the same or a newer
//! version, so re-delivery is harmless.
//!
//! Two strategies, selected by [`TableStorage`](crate::TableStorage):
//!
//! | strategy                    | watermark          | ships                          |
//! |-----------------------------|--------------------|--------------------------------|
//! | [`LsmPartitionReplication`]    | `lsm_sequence`     | rows with a higher sequence    |
//! | [`StaticPartitionReplication`] | `cstable_version`  | the whole `_cstable` file      |

use anyhow::{Context, Result};
use arena::Sha1Hash;
use config::EngineConfig;
use lsmidx::IndexCache;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use crate::reader::{LsmPartitionReader, StaticPartitionReader};
use crate::snapshot::PartitionSnapshot;
use crate::state::ReplicationState;
use crate::table::Table;
use crate::transport::{PartitionAddr, RecordEnvelope, RecordEnvelopeList, ReplicaTransport};
use crate::writer::PartitionWriter;
use crate::PartitionError;

/// A node holding a copy of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaRef {
    pub unique_id: Sha1Hash,
    /// `host:port` of the replica's HTTP endpoint.
    pub addr: String,
    /// The replica is this node.
    pub is_local: bool,
}

impl ReplicaRef {
    pub fn new(unique_id: Sha1Hash, addr: impl Into<String>, is_local: bool) -> Self {
        Self {
            unique_id,
            addr: addr.into(),
            is_local,
        }
    }
}

/// Maps partitions to the nodes that should hold them.
pub trait ReplicationScheme: Send + Sync {
    fn replicas_for(&self, partition_key: &Sha1Hash) -> Vec<ReplicaRef>;

    fn has_local_replica(&self, partition_key: &Sha1Hash) -> bool {
        self.replicas_for(partition_key).iter().any(|r| r.is_local)
    }
}

/// Single node deployment: no partition has replicas.
#[derive(Debug, Default, Clone)]
pub struct StandaloneReplicationScheme;

impl ReplicationScheme for StandaloneReplicationScheme {
    fn replicas_for(&self, _partition_key: &Sha1Hash) -> Vec<ReplicaRef> {
        Vec::new()
    }

    fn has_local_replica(&self, _partition_key: &Sha1Hash) -> bool {
        true
    }
}

/// Every partition is replicated to the same fixed set of nodes.
#[derive(Debug, Clone)]
pub struct FixedReplicationScheme {
    replicas: Vec<ReplicaRef>,
}

impl FixedReplicationScheme {
    pub fn new(replicas: Vec<ReplicaRef>) -> Self {
        Self { replicas }
    }
}

impl ReplicationScheme for FixedReplicationScheme {
    fn replicas_for(&self, _partition_key: &Sha1Hash) -> Vec<ReplicaRef> {
        self.replicas.clone()
    }
}

/// One replication pass over a partition, pinned to the snapshot taken when
/// it was created.
pub trait PartitionReplication {
    /// `true` if any remote replica is behind the snapshot's head.
    fn needs_replication(&self) -> bool;

    /// Brings every lagging remote replica up to the head.
    ///
    /// Returns `Ok(false)` if at least one replica failed; the failures are
    /// logged and the successful replicas are still advanced. `Err` means the
    /// new offsets could not be persisted.
    fn replicate(&self) -> Result<bool>;

    /// Remote replicas known to hold everything up to the head.
    fn num_full_remote_copies(&self) -> usize;
}

/// Shared bookkeeping of both strategies.
struct ReplicationDriver {
    snap: Arc<PartitionSnapshot>,
    writer: Arc<dyn PartitionWriter>,
    scheme: Arc<dyn ReplicationScheme>,
}

impl ReplicationDriver {
    fn remote_replicas(&self) -> Vec<ReplicaRef> {
        self.scheme
            .replicas_for(&self.snap.key)
            .into_iter()
            .filter(|r| !r.is_local)
            .collect()
    }

    fn needs_replication(&self, head: u64) -> bool {
        let state = self.writer.fetch_replication_state();
        self.remote_replicas()
            .iter()
            .any(|r| state.replicated_offset_for(&r.unique_id) < head)
    }

    fn num_full_remote_copies(&self, head: u64) -> usize {
        let state = self.writer.fetch_replication_state();
        self.remote_replicas()
            .iter()
            .filter(|r| state.replicated_offset_for(&r.unique_id) >= head)
            .count()
    }

    fn replicate(
        &self,
        head: u64,
        replicate_to: impl Fn(&ReplicaRef, u64) -> Result<()>,
    ) -> Result<bool> {
        let mut state: ReplicationState = self.writer.fetch_replication_state();
        let mut dirty = false;
        let mut success = true;

        for replica in self.remote_replicas() {
            let offset = state.replicated_offset_for(&replica.unique_id);
            if offset >= head {
                continue;
            }

            debug!(
                namespace = %self.snap.state.tsdb_namespace,
                table = %self.snap.state.table_key,
                partition = %self.snap.key,
                replica = %replica.addr,
                from = offset,
                to = head,
                "replicating partition"
            );

            let started = Instant::now();
            match replicate_to(&replica, offset) {
                Ok(()) => {
                    state.set_replicated_offset_for(replica.unique_id, head);
                    dirty = true;
                    debug!(
                        partition = %self.snap.key,
                        replica = %replica.addr,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "replica up to date"
                    );
                }
                Err(e) => {
                    success = false;
                    error!(
                        namespace = %self.snap.state.tsdb_namespace,
                        table = %self.snap.state.table_key,
                        partition = %self.snap.key,
                        replica = %replica.addr,
                        error = %format!("{:#}", e),
                        "replication failed"
                    );
                }
            }
        }

        if dirty {
            self.writer.commit_replication_state(state)?;
        }
        Ok(success)
    }
}

fn reject_local(replica: &ReplicaRef) -> Result<()> {
    if replica.is_local {
        return Err(PartitionError::IllegalState(format!(
            "refusing to replicate to local replica {}",
            replica.addr
        ))
        .into());
    }
    Ok(())
}

/// Incremental replication of LSM partitions.
pub struct LsmPartitionReplication {
    driver: ReplicationDriver,
    table: Arc<Table>,
    idx_cache: Arc<IndexCache>,
    transport: Arc<dyn ReplicaTransport>,
    batch_rows: usize,
    batch_bytes: usize,
}

impl LsmPartitionReplication {
    pub fn new(
        snap: Arc<PartitionSnapshot>,
        table: Arc<Table>,
        writer: Arc<dyn PartitionWriter>,
        idx_cache: Arc<IndexCache>,
        scheme: Arc<dyn ReplicationScheme>,
        transport: Arc<dyn ReplicaTransport>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            driver: ReplicationDriver {
                snap,
                writer,
                scheme,
            },
            table,
            idx_cache,
            transport,
            batch_rows: config.replication_batch_rows.max(1),
            batch_bytes: config.replication_batch_bytes,
        }
    }

    fn head_offset(&self) -> u64 {
        self.driver.snap.state.lsm_sequence
    }

    /// Ships every committed row above `from_offset` to `replica`.
    pub fn replicate_to(&self, replica: &ReplicaRef, from_offset: u64) -> Result<()> {
        reject_local(replica)?;

        let snap = &self.driver.snap;
        let reader =
            LsmPartitionReader::new(snap.clone(), self.table.clone(), self.idx_cache.clone());
        let partition_key = snap.key.to_hex();

        let mut batch = RecordEnvelopeList::default();
        let mut batch_bytes = 0usize;
        let mut sent = 0usize;

        let mut flush = |batch: &mut RecordEnvelopeList, batch_bytes: &mut usize| -> Result<()> {
            self.transport.upload_batch(&replica.addr, batch)?;
            sent += batch.len();
            batch.records.clear();
            *batch_bytes = 0;
            Ok(())
        };

        reader.fetch_records_since(from_offset, |_, record| {
            let size = record.payload.len();
            if !batch.is_empty() && batch_bytes + size > self.batch_bytes {
                flush(&mut batch, &mut batch_bytes)?;
            }

            batch.records.push(RecordEnvelope {
                tsdb_namespace: snap.state.tsdb_namespace.clone(),
                table_name: snap.state.table_key.clone(),
                partition_key: partition_key.clone(),
                record_id: record.record_id.to_hex(),
                record_version: record.version,
                record_data: record.payload.clone(),
            });
            batch_bytes += size;

            if batch.len() >= self.batch_rows {
                flush(&mut batch, &mut batch_bytes)?;
            }
            Ok(())
        })?;

        if !batch.is_empty() {
            flush(&mut batch, &mut batch_bytes)?;
        }

        debug!(partition = %snap.key, replica = %replica.addr, records = sent, "shipped records");
        Ok(())
    }
}

impl PartitionReplication for LsmPartitionReplication {
    fn needs_replication(&self) -> bool {
        self.driver.needs_replication(self.head_offset())
    }

    fn replicate(&self) -> Result<bool> {
        self.driver
            .replicate(self.head_offset(), |replica, offset| self.replicate_to(replica, offset))
    }

    fn num_full_remote_copies(&self) -> usize {
        self.driver.num_full_remote_copies(self.head_offset())
    }
}

/// Whole-file replication of static partitions.
pub struct StaticPartitionReplication {
    driver: ReplicationDriver,
    table: Arc<Table>,
    transport: Arc<dyn ReplicaTransport>,
}

impl StaticPartitionReplication {
    pub fn new(
        snap: Arc<PartitionSnapshot>,
        table: Arc<Table>,
        writer: Arc<dyn PartitionWriter>,
        scheme: Arc<dyn ReplicationScheme>,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Self {
        Self {
            driver: ReplicationDriver {
                snap,
                writer,
                scheme,
            },
            table,
            transport,
        }
    }

    fn head_version(&self) -> u64 {
        self.driver.snap.state.cstable_version
    }

    /// Uploads the current column table unless `replica` already has it.
    pub fn replicate_to(&self, replica: &ReplicaRef, _from_version: u64) -> Result<()> {
        reject_local(replica)?;

        let snap = &self.driver.snap;
        let head = self.head_version();
        let addr = PartitionAddr {
            namespace: &snap.state.tsdb_namespace,
            table: &snap.state.table_key,
            partition_key: &snap.key,
        };

        if let Some(info) = self.transport.partition_info(&replica.addr, addr)? {
            if info.exists && info.cstable_version >= head {
                debug!(
                    partition = %snap.key,
                    replica = %replica.addr,
                    version = info.cstable_version,
                    "replica already has cstable"
                );
                return Ok(());
            }
        }

        let reader = StaticPartitionReader::new(snap.clone(), self.table.clone());
        let Some(path) = reader.cstable_filename() else {
            return Ok(());
        };
        let data = std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        self.transport.upload_table(&replica.addr, addr, head, data)
    }
}

impl PartitionReplication for StaticPartitionReplication {
    fn needs_replication(&self) -> bool {
        self.driver.needs_replication(self.head_version())
    }

    fn replicate(&self) -> Result<bool> {
        self.driver
            .replicate(self.head_version(), |replica, offset| self.replicate_to(replica, offset))
    }

    fn num_full_remote_copies(&self) -> usize {
        self.driver.num_full_remote_copies(self.head_version())
    }
}
