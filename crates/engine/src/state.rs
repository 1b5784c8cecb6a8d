//! # Partition state - the `_snapshot` file
//!
//! [`PartitionState`] is the only durable description of a partition: which
//! table files belong to it, the last assigned sequence number and how far
//! each replica has been brought up to date. Table files on disk that the
//! state does not reference are garbage; referenced files that are missing
//! mean the partition is corrupt.
//!
//! ## File Format
//!
//! Pretty-printed JSON, so operators can inspect a partition with any text
//! editor:
//!
//! ```text
//! {
//!   "tsdb_namespace": "metrics",
//!   "table_key": "cpu",
//!   "partition_key": "0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33",
//!   "uuid": "67e55044-10b1-426f-9247-bb680e5fe0c8",
//!   "lsm_sequence": 4096,
//!   "lsm_generation": 3,
//!   "lsm_tables": [
//!     { "filename": "8c1f0e2d9a7b3c4d", "first_sequence": 1, "last_sequence": 4096 }
//!   ],
//!   "cstable_version": 0,
//!   "replication_state": { "uuid": "67e55044-...", "replicas": { "<replica id>": 4096 } }
//! }
//! ```
//!
//! ## Crash Safety
//!
//! The state is rewritten atomically: write `_snapshot.tmp`, fsync, rename
//! over `_snapshot`, fsync the directory.

use anyhow::{Context, Result};
use arena::Sha1Hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// Name of the state file within a partition directory.
pub const SNAPSHOT_FILENAME: &str = "_snapshot";

const SNAPSHOT_TMP_FILENAME: &str = "_snapshot.tmp";

/// One immutable table file (`<filename>.cst` + `<filename>.idx`) and the
/// sequence range of the rows it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsmTableRef {
    pub filename: String,
    pub first_sequence: u64,
    pub last_sequence: u64,
}

/// Per-replica replication watermarks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
    /// Partition incarnation the offsets belong to.
    pub uuid: Uuid,
    pub replicas: BTreeMap<Sha1Hash, u64>,
}

impl ReplicationState {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            replicas: BTreeMap::new(),
        }
    }

    /// Highest offset known to be applied on `replica`, `0` if unknown.
    pub fn replicated_offset_for(&self, replica: &Sha1Hash) -> u64 {
        self.replicas.get(replica).copied().unwrap_or(0)
    }

    pub fn set_replicated_offset_for(&mut self, replica: Sha1Hash, offset: u64) {
        self.replicas.insert(replica, offset);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionState {
    pub tsdb_namespace: String,
    pub table_key: String,
    pub partition_key: Sha1Hash,
    pub uuid: Uuid,
    /// Last sequence number assigned to a committed record.
    pub lsm_sequence: u64,
    /// Bumped every time the table list is spliced by compaction.
    pub lsm_generation: u64,
    pub lsm_tables: Vec<LsmTableRef>,
    /// Version of the installed `_cstable` for static tables, `0` if none.
    pub cstable_version: u64,
    pub replication_state: ReplicationState,
}

impl PartitionState {
    /// A fresh state with a new random incarnation id.
    pub fn new(
        tsdb_namespace: impl Into<String>,
        table_key: impl Into<String>,
        partition_key: Sha1Hash,
    ) -> Self {
        let uuid = Uuid::new_v4();
        Self {
            tsdb_namespace: tsdb_namespace.into(),
            table_key: table_key.into(),
            partition_key,
            uuid,
            lsm_sequence: 0,
            lsm_generation: 0,
            lsm_tables: Vec::new(),
            cstable_version: 0,
            replication_state: ReplicationState::new(uuid),
        }
    }

    /// Loads `dir/_snapshot`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be parsed.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SNAPSHOT_FILENAME);
        let data = fs::read(&path)
            .with_context(|| format!("failed to read partition state at {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse partition state at {}", path.display()))
    }

    /// Persists the state to `dir/_snapshot`.
    pub fn save(&self, dir: &Path, fsync: bool) -> Result<()> {
        let tmp_path = dir.join(SNAPSHOT_TMP_FILENAME);
        let path = dir.join(SNAPSHOT_FILENAME);
        let data = serde_json::to_vec_pretty(self)?;

        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| {
                    format!("failed to create state tmp at {}", tmp_path.display())
                })?;
            f.write_all(&data)?;
            f.flush()?;
            if fsync {
                f.sync_all()?;
            }
        }

        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to install partition state at {}", path.display()))?;

        if fsync {
            if let Ok(d) = File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }
}
