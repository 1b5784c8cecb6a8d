use anyhow::{Context, Result};
use arena::{Record, RecordId};
use config::EngineConfig;
use cstable::CsTableReader;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::snapshot::PartitionSnapshotRef;
use crate::state::ReplicationState;
use crate::writer::{PartitionWriter, WriterCore};
use crate::PartitionError;

/// File holding the single column table of a static partition.
pub const STATIC_TABLE_FILENAME: &str = "_cstable";

const STATIC_TABLE_TMP_FILENAME: &str = "_cstable.tmp";

/// Writer for [`TableStorage::Static`](crate::TableStorage::Static)
/// partitions. The whole table is replaced at once by
/// [`update_table`](Self::update_table); record inserts are refused.
#[derive(Debug)]
pub struct StaticPartitionWriter {
    core: WriterCore,
    update_lock: Mutex<()>,
}

impl StaticPartitionWriter {
    pub fn new(head: Arc<PartitionSnapshotRef>, config: &EngineConfig) -> Self {
        Self {
            core: WriterCore::new(head, config.fsync),
            update_lock: Mutex::new(()),
        }
    }

    /// Installs `data` as the partition's column table at `version`.
    ///
    /// The file is validated before it replaces the current one. Returns
    /// `false` if the partition already holds `version` or a newer one.
    pub fn update_table(&self, data: &[u8], version: u64) -> Result<bool> {
        self.core.check_not_frozen()?;
        let _guard = self.update_lock.lock();

        let snap = self.core.head.get();
        if version <= snap.state.cstable_version {
            debug!(
                partition = %snap.key,
                version,
                current = snap.state.cstable_version,
                "ignoring stale cstable"
            );
            return Ok(false);
        }

        let tmp_path = snap.base_path.join(STATIC_TABLE_TMP_FILENAME);
        let path = snap.base_path.join(STATIC_TABLE_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            f.write_all(data)?;
            f.sync_all()?;
        }

        if let Err(e) = CsTableReader::open(&tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.context(PartitionError::Corrupt(format!(
                "rejected cstable version {} for partition {}",
                version, snap.key
            ))));
        }

        fs::rename(&tmp_path, &path)?;
        self.core.update(|next| {
            next.state.cstable_version = version;
            Ok(())
        })?;

        debug!(partition = %snap.key, version, bytes = data.len(), "installed cstable");
        Ok(true)
    }
}

impl PartitionWriter for StaticPartitionWriter {
    fn insert_records(&self, records: Vec<Record>) -> Result<HashSet<RecordId>> {
        warn!(
            partition = %self.core.head.get().key,
            records = records.len(),
            "insert into static partition refused"
        );
        Err(PartitionError::IllegalState(
            "static partitions can only be replaced as a whole".to_string(),
        )
        .into())
    }

    fn commit(&self) -> Result<bool> {
        Ok(false)
    }

    fn compact(&self) -> Result<bool> {
        Ok(false)
    }

    fn needs_commit(&self) -> bool {
        false
    }

    fn needs_urgent_commit(&self) -> bool {
        false
    }

    fn needs_compaction(&self) -> bool {
        false
    }

    fn needs_urgent_compaction(&self) -> bool {
        false
    }

    fn fetch_replication_state(&self) -> ReplicationState {
        self.core.fetch_replication_state()
    }

    fn commit_replication_state(&self, state: ReplicationState) -> Result<()> {
        self.core.commit_replication_state(state)
    }

    fn freeze(&self) {
        self.core.freeze();
    }

    fn unfreeze(&self) {
        self.core.unfreeze();
    }

    fn is_frozen(&self) -> bool {
        self.core.is_frozen()
    }
}
