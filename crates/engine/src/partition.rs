use anyhow::{Context, Result};
use arena::{RecordId, Sha1Hash};
use config::EngineConfig;
use lsmidx::IndexCache;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::compaction::SimpleCompactionStrategy;
use crate::reader::{LsmPartitionReader, PartitionReader};
use crate::replication::{
    LsmPartitionReplication, PartitionReplication, ReplicationScheme, StaticPartitionReplication,
};
use crate::snapshot::{PartitionSnapshot, PartitionSnapshotRef};
use crate::state::{PartitionState, SNAPSHOT_FILENAME};
use crate::static_writer::{StaticPartitionWriter, STATIC_TABLE_FILENAME};
use crate::table::{Table, TableStorage};
use crate::transport::{PartitionInfo, RecordEnvelopeList, ReplicaTransport};
use crate::writer::{LsmPartitionWriter, PartitionWriter};
use crate::PartitionError;

/// Process-wide services shared by all partitions.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub idx_cache: Arc<IndexCache>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            idx_cache: Arc::new(IndexCache::new()),
        }
    }
}

enum WriterHandle {
    Lsm(Arc<LsmPartitionWriter>),
    Static(Arc<StaticPartitionWriter>),
}

/// One partition of a table: its published snapshot plus the writer that
/// mutates it.
///
/// Partitions live in `<db_path>/<namespace>/<sha1(table)>/<partition key>`:
///
/// ```text
/// _snapshot            PartitionState (JSON)
/// <name>.cst           column table, one per flush or compaction output
/// <name>.idx           id -> version index of <name>.cst
/// _cstable             the column table of a static partition
/// ```
pub struct Partition {
    head: Arc<PartitionSnapshotRef>,
    table: Arc<Table>,
    writer: WriterHandle,
    ctx: EngineContext,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.head.get();
        f.debug_struct("Partition")
            .field("namespace", &snap.state.tsdb_namespace)
            .field("table", &snap.state.table_key)
            .field("key", &snap.key)
            .field("lsm_sequence", &snap.state.lsm_sequence)
            .field("tables", &snap.state.lsm_tables.len())
            .field("cstable_version", &snap.state.cstable_version)
            .finish()
    }
}

impl Partition {
    /// Directory of a partition below `db_path`.
    pub fn partition_path(db_path: &Path, table: &Table, key: &Sha1Hash) -> PathBuf {
        db_path
            .join(table.namespace())
            .join(Sha1Hash::compute(table.name()).to_hex())
            .join(key.to_hex())
    }

    /// Creates a new, empty partition on disk.
    ///
    /// # Errors
    ///
    /// Fails with [`PartitionError::IllegalState`] if the partition already
    /// exists.
    pub fn create(
        table: Arc<Table>,
        key: Sha1Hash,
        db_path: &Path,
        ctx: &EngineContext,
    ) -> Result<Arc<Self>> {
        let base_path = Self::partition_path(db_path, &table, &key);
        if base_path.join(SNAPSHOT_FILENAME).exists() {
            return Err(PartitionError::IllegalState(format!(
                "partition {} already exists at {}",
                key,
                base_path.display()
            ))
            .into());
        }

        fs::create_dir_all(&base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;
        let state = PartitionState::new(table.namespace(), table.name(), key);
        state.save(&base_path, ctx.config.fsync)?;

        info!(
            namespace = %table.namespace(),
            table = %table.name(),
            partition = %key,
            "created partition"
        );
        Ok(Arc::new(Self::build(state, base_path, table, ctx)))
    }

    /// Loads an existing partition.
    ///
    /// Leftover temp files are removed and table files not referenced from
    /// `_snapshot` are deleted.
    ///
    /// # Errors
    ///
    /// Fails with [`PartitionError::Corrupt`] if the state belongs to another
    /// partition or references a missing file.
    pub fn reopen(
        table: Arc<Table>,
        key: Sha1Hash,
        db_path: &Path,
        ctx: &EngineContext,
    ) -> Result<Arc<Self>> {
        let base_path = Self::partition_path(db_path, &table, &key);
        let state = PartitionState::load(&base_path)?;

        if state.partition_key != key || state.table_key != table.name() {
            return Err(PartitionError::Corrupt(format!(
                "state at {} belongs to {}/{}",
                base_path.display(),
                state.table_key,
                state.partition_key
            ))
            .into());
        }

        recover_directory(&state, &base_path, table.storage())?;

        debug!(
            namespace = %state.tsdb_namespace,
            table = %state.table_key,
            partition = %key,
            lsm_sequence = state.lsm_sequence,
            tables = state.lsm_tables.len(),
            "reopened partition"
        );
        Ok(Arc::new(Self::build(state, base_path, table, ctx)))
    }

    /// Reopens the partition if it exists on disk, creates it otherwise.
    pub fn open_or_create(
        table: Arc<Table>,
        key: Sha1Hash,
        db_path: &Path,
        ctx: &EngineContext,
    ) -> Result<Arc<Self>> {
        if Self::partition_path(db_path, &table, &key)
            .join(SNAPSHOT_FILENAME)
            .exists()
        {
            Self::reopen(table, key, db_path, ctx)
        } else {
            Self::create(table, key, db_path, ctx)
        }
    }

    fn build(
        state: PartitionState,
        base_path: PathBuf,
        table: Arc<Table>,
        ctx: &EngineContext,
    ) -> Self {
        let head = Arc::new(PartitionSnapshotRef::new(PartitionSnapshot::new(
            state,
            base_path.clone(),
        )));

        let writer = match table.storage() {
            TableStorage::Lsm => {
                let strategy = SimpleCompactionStrategy::new(
                    table.clone(),
                    base_path,
                    ctx.idx_cache.clone(),
                    ctx.config.compaction_soft_limit,
                    ctx.config.compaction_hard_limit,
                );
                WriterHandle::Lsm(Arc::new(LsmPartitionWriter::new(
                    head.clone(),
                    table.clone(),
                    ctx.idx_cache.clone(),
                    Box::new(strategy),
                    &ctx.config,
                )))
            }
            TableStorage::Static => WriterHandle::Static(Arc::new(StaticPartitionWriter::new(
                head.clone(),
                &ctx.config,
            ))),
        };

        Self {
            head,
            table,
            writer,
            ctx: ctx.clone(),
        }
    }

    pub fn key(&self) -> Sha1Hash {
        self.head.get().key
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn base_path(&self) -> PathBuf {
        self.head.get().base_path.clone()
    }

    pub fn snapshot(&self) -> Arc<PartitionSnapshot> {
        self.head.get()
    }

    pub fn writer(&self) -> Arc<dyn PartitionWriter> {
        match &self.writer {
            WriterHandle::Lsm(w) => w.clone(),
            WriterHandle::Static(w) => w.clone(),
        }
    }

    /// A reader pinned to the current snapshot.
    pub fn reader(&self) -> PartitionReader {
        PartitionReader::new(self.head.get(), self.table.clone(), self.ctx.idx_cache.clone())
    }

    /// Installs a complete column table in a static partition.
    pub fn update_cstable(&self, data: &[u8], version: u64) -> Result<bool> {
        match &self.writer {
            WriterHandle::Static(w) => w.update_table(data, version),
            WriterHandle::Lsm(_) => Err(PartitionError::IllegalState(format!(
                "table {} is not static",
                self.table.name()
            ))
            .into()),
        }
    }

    /// Applies a batch received from a replicating peer through the regular
    /// insert path. Returns the ids that were new or newer.
    pub fn apply_replicated(&self, batch: RecordEnvelopeList) -> Result<HashSet<RecordId>> {
        let key = self.key();
        let mut records = Vec::with_capacity(batch.len());
        for envelope in batch.records {
            if envelope.partition_key()? != key {
                return Err(PartitionError::IllegalState(format!(
                    "envelope for partition {} sent to {}",
                    envelope.partition_key, key
                ))
                .into());
            }
            records.push(envelope.into_record()?);
        }
        self.writer().insert_records(records)
    }

    pub fn info(&self) -> PartitionInfo {
        let snap = self.head.get();
        PartitionInfo {
            partition_key: snap.key,
            table_key: snap.state.table_key.clone(),
            namespace: snap.state.tsdb_namespace.clone(),
            uuid: snap.state.uuid,
            lsm_sequence: snap.state.lsm_sequence,
            cstable_version: snap.state.cstable_version,
            num_tables: snap.state.lsm_tables.len(),
            checksum: Sha1Hash::compute(format!("{}~{}", snap.key, snap.state.lsm_sequence)),
            exists: true,
        }
    }

    /// A replication pass over the current snapshot, using the strategy of
    /// the table's storage kind.
    pub fn replication(
        &self,
        scheme: Arc<dyn ReplicationScheme>,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Box<dyn PartitionReplication> {
        let snap = self.head.get();
        match self.table.storage() {
            TableStorage::Lsm => Box::new(LsmPartitionReplication::new(
                snap,
                self.table.clone(),
                self.writer(),
                self.ctx.idx_cache.clone(),
                scheme,
                transport,
                &self.ctx.config,
            )),
            TableStorage::Static => Box::new(StaticPartitionReplication::new(
                snap,
                self.table.clone(),
                self.writer(),
                scheme,
                transport,
            )),
        }
    }

    /// Convenience: a reader over an LSM partition.
    pub fn lsm_reader(&self) -> Result<LsmPartitionReader> {
        match self.reader() {
            PartitionReader::Lsm(r) => Ok(r),
            PartitionReader::Static(_) => Err(PartitionError::IllegalState(format!(
                "table {} is static",
                self.table.name()
            ))
            .into()),
        }
    }
}

/// Brings a partition directory in line with its state on reopen.
fn recover_directory(
    state: &PartitionState,
    base_path: &Path,
    storage: TableStorage,
) -> Result<()> {
    let mut referenced = HashSet::new();
    for t in &state.lsm_tables {
        for ext in ["cst", "idx"] {
            let path = base_path.join(format!("{}.{}", t.filename, ext));
            if !path.exists() {
                return Err(PartitionError::Corrupt(format!(
                    "missing table file {}",
                    path.display()
                ))
                .into());
            }
        }
        referenced.insert(t.filename.as_str());
    }

    if storage == TableStorage::Static
        && state.cstable_version > 0
        && !base_path.join(STATIC_TABLE_FILENAME).exists()
    {
        return Err(PartitionError::Corrupt(format!(
            "missing {} in {}",
            STATIC_TABLE_FILENAME,
            base_path.display()
        ))
        .into());
    }

    for entry in fs::read_dir(base_path)?.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name.ends_with(".tmp") {
            let _ = fs::remove_file(&path);
            continue;
        }

        let orphan = match name.rsplit_once('.') {
            Some((stem, "cst" | "idx")) => !referenced.contains(stem),
            _ => false,
        };
        if orphan {
            warn!(path = %path.display(), "deleting unreferenced table file");
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete {}", path.display()))?;
        }
    }
    Ok(())
}
