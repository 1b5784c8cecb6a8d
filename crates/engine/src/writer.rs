//! # Partition writers
//!
//! A [`PartitionWriter`] owns all mutations of one partition. Three locks
//! serialize them:
//!
//! ```text
//! write lock       guards live-version checks, arena flips and every snapshot swap
//! commit lock      at most one arena flush in flight
//! compaction lock  at most one compaction; try-locked, never queued
//! ```
//!
//! The write lock is never held across table file I/O, so inserts keep
//! flowing into a fresh head arena while an older one is flushed or tables
//! are compacted. Snapshot persistence (`_snapshot`) is the exception: it
//! is written under the write lock so the file and the published snapshot
//! never disagree.
//!
//! ## Commit
//!
//! ```text
//!  write lock │ head arena ──freeze──▶ compacting arena, new empty head arena
//!  (no lock)  │ compacting arena ──▶ <name>.cst + <name>.idx
//!  write lock │ append LsmTableRef, lsm_sequence += n, drop compacting arena, persist
//! ```
//!
//! A failed flush leaves the compacting arena in place; the next commit
//! retries it before flipping the head arena again.

use anyhow::{Context, Result};
use arena::{Record, RecordArena, RecordId};
use config::EngineConfig;
use lsmidx::IndexCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::compaction::CompactionStrategy;
use crate::lsm_table::{random_filename, write_arena_to_disk};
use crate::snapshot::{PartitionSnapshot, PartitionSnapshotRef};
use crate::state::{LsmTableRef, ReplicationState};
use crate::table::Table;
use crate::PartitionError;

/// Write-side interface shared by all storage kinds.
pub trait PartitionWriter: Send + Sync {
    /// Inserts every record whose version is newer than the live version of
    /// its id and returns the ids that were inserted. Stale records are
    /// dropped silently.
    fn insert_records(&self, records: Vec<Record>) -> Result<HashSet<RecordId>>;

    fn insert_record(&self, record: Record) -> Result<bool> {
        Ok(!self.insert_records(vec![record])?.is_empty())
    }

    /// Flushes pending records to a new table file. Returns `false` if there
    /// was nothing to flush.
    fn commit(&self) -> Result<bool>;

    /// Runs the compaction strategy if no other compaction is in progress.
    /// Returns `true` if anything changed on disk.
    fn compact(&self) -> Result<bool>;

    fn needs_commit(&self) -> bool;
    fn needs_urgent_commit(&self) -> bool;
    fn needs_compaction(&self) -> bool;
    fn needs_urgent_compaction(&self) -> bool;

    /// Current replication offsets. Offsets recorded for an older incarnation
    /// of the partition are discarded.
    fn fetch_replication_state(&self) -> ReplicationState;

    /// Merges `state` into the persisted replication offsets. A replica's
    /// offset never decreases.
    ///
    /// # Errors
    ///
    /// Fails with [`PartitionError::IllegalState`] if `state` belongs to a
    /// different partition incarnation.
    fn commit_replication_state(&self, state: ReplicationState) -> Result<()>;

    /// Stops accepting writes.
    fn freeze(&self);
    fn unfreeze(&self);
    fn is_frozen(&self) -> bool;
}

/// Snapshot publication shared by every writer kind.
#[derive(Debug)]
pub(crate) struct WriterCore {
    pub head: Arc<PartitionSnapshotRef>,
    pub write_lock: Mutex<()>,
    frozen: AtomicBool,
    fsync: bool,
}

impl WriterCore {
    pub fn new(head: Arc<PartitionSnapshotRef>, fsync: bool) -> Self {
        Self {
            head,
            write_lock: Mutex::new(()),
            frozen: AtomicBool::new(false),
            fsync,
        }
    }

    /// Clones the current snapshot, applies `f`, persists the resulting
    /// state and publishes it, all under the write lock. Nothing is
    /// published if `f` or the save fails.
    pub fn update<T>(&self, f: impl FnOnce(&mut PartitionSnapshot) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut next = (*self.head.get()).clone();
        let out = f(&mut next)?;
        next.state.save(&next.base_path, self.fsync)?;
        self.head.set(next);
        Ok(out)
    }

    pub fn partition_name(&self) -> String {
        let snap = self.head.get();
        format!(
            "{}/{}/{}",
            snap.state.tsdb_namespace, snap.state.table_key, snap.key
        )
    }

    pub fn fetch_replication_state(&self) -> ReplicationState {
        let snap = self.head.get();
        let state = &snap.state.replication_state;
        if state.uuid == snap.state.uuid {
            state.clone()
        } else {
            ReplicationState::new(snap.state.uuid)
        }
    }

    pub fn commit_replication_state(&self, state: ReplicationState) -> Result<()> {
        self.update(|next| {
            if state.uuid != next.state.uuid {
                return Err(PartitionError::IllegalState(format!(
                    "replication state belongs to incarnation {}, partition is {}",
                    state.uuid, next.state.uuid
                ))
                .into());
            }
            // Offsets only move forward; a pass started from an older state
            // must not undo progress another pass already recorded.
            let merged = &mut next.state.replication_state;
            if merged.uuid != state.uuid {
                *merged = ReplicationState::new(state.uuid);
            }
            for (replica, offset) in state.replicas {
                let current = merged.replicated_offset_for(&replica);
                merged.set_replicated_offset_for(replica, current.max(offset));
            }
            Ok(())
        })
    }

    pub fn check_not_frozen(&self) -> Result<()> {
        if self.is_frozen() {
            return Err(PartitionError::Frozen(self.partition_name()).into());
        }
        Ok(())
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn unfreeze(&self) {
        self.frozen.store(false, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

/// Writer for [`TableStorage::Lsm`](crate::TableStorage::Lsm) partitions.
pub struct LsmPartitionWriter {
    core: WriterCore,
    table: Arc<Table>,
    idx_cache: Arc<IndexCache>,
    compaction_strategy: Box<dyn CompactionStrategy>,
    commit_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    max_arena_records: usize,
    max_arena_bytes: usize,
}

impl std::fmt::Debug for LsmPartitionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.core.head.get();
        f.debug_struct("LsmPartitionWriter")
            .field("partition", &snap.key)
            .field("lsm_sequence", &snap.state.lsm_sequence)
            .field("tables", &snap.state.lsm_tables.len())
            .field("pending_records", &snap.num_pending_records())
            .field("frozen", &self.core.is_frozen())
            .finish()
    }
}

impl LsmPartitionWriter {
    pub fn new(
        head: Arc<PartitionSnapshotRef>,
        table: Arc<Table>,
        idx_cache: Arc<IndexCache>,
        compaction_strategy: Box<dyn CompactionStrategy>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            core: WriterCore::new(head, config.fsync),
            table,
            idx_cache,
            compaction_strategy,
            commit_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            max_arena_records: config.max_arena_records,
            max_arena_bytes: config.max_arena_bytes,
        }
    }

    /// Live version of every id in `ids`, `0` for ids never seen.
    ///
    /// Must be called with the write lock held.
    fn live_versions(
        &self,
        snap: &PartitionSnapshot,
        ids: impl Iterator<Item = RecordId>,
    ) -> Result<HashMap<RecordId, u64>> {
        let mut live = HashMap::new();
        let mut pending = HashSet::new();

        for id in ids {
            let mut version = snap.head_arena.fetch_record_version(&id);
            if let Some(arena) = &snap.compacting_arena {
                version = version.max(arena.fetch_record_version(&id));
            }
            live.insert(id, version);
            if version == 0 {
                pending.insert(id);
            }
        }

        // Newest table first: the first hit for an id is its live version.
        for table in snap.state.lsm_tables.iter().rev() {
            if pending.is_empty() {
                break;
            }
            let idx = self.idx_cache.lookup(&snap.index_path(&table.filename))?;
            let mut candidates: HashMap<RecordId, u64> =
                pending.iter().map(|id| (*id, 0)).collect();
            idx.lookup(&mut candidates);
            for (id, version) in candidates {
                if version > 0 {
                    live.insert(id, version);
                    pending.remove(&id);
                }
            }
        }

        Ok(live)
    }

    fn write_compacting_arena(
        &self,
        arena: &RecordArena,
        snap: &PartitionSnapshot,
    ) -> Result<LsmTableRef> {
        let schema = self.table.schema();
        let filename = random_filename();
        let first_sequence = snap.state.lsm_sequence + 1;

        let rows = write_arena_to_disk(
            arena,
            &schema,
            first_sequence,
            &snap.table_path(&filename),
            &snap.index_path(&filename),
        )?;

        Ok(LsmTableRef {
            filename,
            first_sequence,
            last_sequence: first_sequence + rows - 1,
        })
    }

    fn remove_table_files(&self, snap: &PartitionSnapshot, filename: &str) {
        let idx_path = snap.index_path(filename);
        for path in [snap.table_path(filename), idx_path.clone()] {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to delete table file");
            }
        }
        self.idx_cache.flush(&idx_path);
    }
}

impl PartitionWriter for LsmPartitionWriter {
    fn insert_records(&self, mut records: Vec<Record>) -> Result<HashSet<RecordId>> {
        self.core.check_not_frozen()?;

        // Reject the whole batch before touching the arena if any payload
        // doesn't match the schema; a bad row would otherwise fail the flush.
        let schema = self.table.schema();
        for r in &records {
            msg::decode(&r.payload, &schema)
                .with_context(|| format!("invalid payload for record {}", r.record_id))?;
        }

        let mut inserted = HashSet::new();
        {
            let _guard = self.core.write_lock.lock();
            let snap = self.core.head.get();
            let mut live = self.live_versions(&snap, records.iter().map(|r| r.record_id))?;

            for record in records.drain(..) {
                let current = live.get(&record.record_id).copied().unwrap_or(0);
                if record.version <= current {
                    continue;
                }
                let id = record.record_id;
                let version = record.version;
                let record = Record {
                    is_update: current > 0,
                    ..record
                };
                if snap.head_arena.insert_record(record) {
                    live.insert(id, version);
                    inserted.insert(id);
                }
            }

            trace!(
                partition = %snap.key,
                records = inserted.len(),
                arena = snap.head_arena.size(),
                "inserted records"
            );
        }

        if self.needs_urgent_commit() {
            self.commit()?;
        }
        if self.needs_urgent_compaction() {
            self.compact()?;
        }

        Ok(inserted)
    }

    fn commit(&self) -> Result<bool> {
        let _commit_guard = self.commit_lock.lock();
        let started = Instant::now();

        let (arena, snap) = {
            let _guard = self.core.write_lock.lock();
            let snap = self.core.head.get();
            if let Some(arena) = snap.compacting_arena.clone() {
                (arena, snap)
            } else {
                if snap.head_arena.is_empty() {
                    return Ok(false);
                }
                let mut next = (*snap).clone();
                let arena = next.head_arena.clone();
                arena.freeze();
                next.compacting_arena = Some(arena.clone());
                next.head_arena = Arc::new(RecordArena::new());
                self.core.head.set(next);
                (arena, self.core.head.get())
            }
        };

        let table_ref = self.write_compacting_arena(&arena, &snap)?;
        let records = arena.size();

        let result = self.core.update(|next| {
            next.state.lsm_sequence = table_ref.last_sequence;
            next.state.lsm_tables.push(table_ref.clone());
            next.compacting_arena = None;
            Ok(())
        });
        if let Err(e) = result {
            self.remove_table_files(&snap, &table_ref.filename);
            return Err(e);
        }

        debug!(
            namespace = %snap.state.tsdb_namespace,
            table = %snap.state.table_key,
            partition = %snap.key,
            records,
            file = %table_ref.filename,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "committed arena"
        );
        Ok(true)
    }

    fn compact(&self) -> Result<bool> {
        let Some(_compaction_guard) = self.compaction_lock.try_lock() else {
            return Ok(false);
        };

        let committed = self.commit()?;
        let started = Instant::now();

        let snap = self.core.head.get();
        let old_tables = snap.state.lsm_tables.clone();
        let generation = snap.state.lsm_generation;

        let mut new_tables = Vec::new();
        if !self
            .compaction_strategy
            .compact(&old_tables, &mut new_tables)?
        {
            return Ok(committed);
        }

        let partition = self.core.partition_name();
        let spliced = self.core.update(|next| {
            let live = &next.state.lsm_tables;
            let prefix_matches = live.len() >= old_tables.len()
                && live
                    .iter()
                    .zip(&old_tables)
                    .all(|(a, b)| a.filename == b.filename);
            if next.state.lsm_generation != generation || !prefix_matches {
                return Err(PartitionError::ConcurrentModification {
                    partition: partition.clone(),
                    reason: format!(
                        "table list changed during compaction (generation {} -> {})",
                        generation, next.state.lsm_generation
                    ),
                }
                .into());
            }

            let mut tables = new_tables.clone();
            tables.extend_from_slice(&live[old_tables.len()..]);
            next.state.lsm_tables = tables;
            next.state.lsm_generation += 1;
            Ok(())
        });

        if let Err(e) = spliced {
            for t in &new_tables {
                self.remove_table_files(&snap, &t.filename);
            }
            return Err(e);
        }

        let keep: HashSet<&str> = new_tables.iter().map(|t| t.filename.as_str()).collect();
        for t in old_tables.iter().filter(|t| !keep.contains(t.filename.as_str())) {
            self.remove_table_files(&snap, &t.filename);
        }

        debug!(
            namespace = %snap.state.tsdb_namespace,
            table = %snap.state.table_key,
            partition = %snap.key,
            input_tables = old_tables.len(),
            output_tables = new_tables.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compacted partition"
        );
        Ok(true)
    }

    fn needs_commit(&self) -> bool {
        let snap = self.core.head.get();
        !snap.head_arena.is_empty() || snap.compacting_arena.is_some()
    }

    fn needs_urgent_commit(&self) -> bool {
        let snap = self.core.head.get();
        snap.head_arena.size() > self.max_arena_records
            || snap.head_arena.approx_size() > self.max_arena_bytes
    }

    fn needs_compaction(&self) -> bool {
        self.compaction_strategy
            .needs_compaction(&self.core.head.get().state.lsm_tables)
    }

    fn needs_urgent_compaction(&self) -> bool {
        self.compaction_strategy
            .needs_urgent_compaction(&self.core.head.get().state.lsm_tables)
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
