use arena::{RecordArena, Sha1Hash};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::state::PartitionState;

/// Immutable view of one partition at a point in time.
///
/// Never mutated after publication: writers clone the current snapshot,
/// modify the clone and install it through [`PartitionSnapshotRef::set`].
/// The arenas are shared between a snapshot and its clones, so records
/// inserted into the head arena are visible through every snapshot that
/// references it.
#[derive(Debug, Clone)]
pub struct PartitionSnapshot {
    pub key: Sha1Hash,
    pub state: PartitionState,
    pub base_path: PathBuf,
    pub head_arena: Arc<RecordArena>,
    /// Arena currently being flushed, if any.
    pub compacting_arena: Option<Arc<RecordArena>>,
}

impl PartitionSnapshot {
    pub fn new(state: PartitionState, base_path: PathBuf) -> Self {
        Self {
            key: state.partition_key,
            state,
            base_path,
            head_arena: Arc::new(RecordArena::new()),
            compacting_arena: None,
        }
    }

    pub fn table_path(&self, filename: &str) -> PathBuf {
        self.base_path.join(format!("{}.cst", filename))
    }

    pub fn index_path(&self, filename: &str) -> PathBuf {
        self.base_path.join(format!("{}.idx", filename))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Records held in memory and not yet part of any table file.
    pub fn num_pending_records(&self) -> usize {
        self.head_arena.size() + self.compacting_arena.as_ref().map_or(0, |a| a.size())
    }
}

/// The published snapshot of a partition.
///
/// Readers call [`get`](Self::get) and keep the returned `Arc` as long as
/// they like; later swaps don't affect them.
#[derive(Debug)]
pub struct PartitionSnapshotRef {
    inner: RwLock<Arc<PartitionSnapshot>>,
}

impl PartitionSnapshotRef {
    pub fn new(snapshot: PartitionSnapshot) -> Self {
        Self {
            inner: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn get(&self) -> Arc<PartitionSnapshot> {
        self.inner.read().clone()
    }

    /// Installs `snapshot`. Callers must hold the partition's write lock.
    pub fn set(&self, snapshot: PartitionSnapshot) {
        *self.inner.write() = Arc::new(snapshot);
    }
}
