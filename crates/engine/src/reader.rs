use anyhow::Result;
use arena::{Record, RecordId};
use cstable::{CsTableReader, RecordMaterializer};
use lsmidx::IndexCache;
use msg::MessageObject;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::lsm_table::TableScanner;
use crate::snapshot::PartitionSnapshot;
use crate::static_writer::STATIC_TABLE_FILENAME;
use crate::table::{Table, TableStorage};

/// Read access to one partition, pinned to the snapshot it was created from.
pub enum PartitionReader {
    Lsm(LsmPartitionReader),
    Static(StaticPartitionReader),
}

impl PartitionReader {
    pub fn new(
        snap: Arc<PartitionSnapshot>,
        table: Arc<Table>,
        idx_cache: Arc<IndexCache>,
    ) -> Self {
        match table.storage() {
            TableStorage::Lsm => {
                PartitionReader::Lsm(LsmPartitionReader::new(snap, table, idx_cache))
            }
            TableStorage::Static => {
                PartitionReader::Static(StaticPartitionReader::new(snap, table))
            }
        }
    }

    pub fn snapshot(&self) -> &Arc<PartitionSnapshot> {
        match self {
            PartitionReader::Lsm(r) => &r.snap,
            PartitionReader::Static(r) => &r.snap,
        }
    }
}

/// Reader over the arenas and table files of an LSM partition.
pub struct LsmPartitionReader {
    snap: Arc<PartitionSnapshot>,
    table: Arc<Table>,
    idx_cache: Arc<IndexCache>,
}

impl LsmPartitionReader {
    pub fn new(
        snap: Arc<PartitionSnapshot>,
        table: Arc<Table>,
        idx_cache: Arc<IndexCache>,
    ) -> Self {
        Self {
            snap,
            table,
            idx_cache,
        }
    }

    /// Calls `f` with the live version of every record in the partition.
    ///
    /// In-memory records are visited first, then table files newest first.
    pub fn fetch_records<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Record) -> Result<()>,
    {
        let mut seen: HashSet<RecordId> = HashSet::new();

        let arenas =
            std::iter::once(&self.snap.head_arena).chain(self.snap.compacting_arena.as_ref());
        for arena in arenas {
            // Copy out so `f` runs without the arena lock held.
            let mut records = Vec::with_capacity(arena.size());
            arena.fetch_records(|r| -> Result<()> {
                records.push(r.clone());
                Ok(())
            })?;
            for r in &records {
                if seen.insert(r.record_id) {
                    f(r)?;
                }
            }
        }

        let schema = self.table.schema();
        for t in self.snap.state.lsm_tables.iter().rev() {
            let mut scanner =
                TableScanner::open(&self.snap.table_path(&t.filename), schema.clone())?;
            while let Some(key) = scanner.next_key()? {
                if seen.insert(key.record_id) {
                    f(&scanner.read_record(&key)?)?;
                } else {
                    scanner.skip_payload()?;
                }
            }
        }
        Ok(())
    }

    /// Returns the live version of `id`, if any.
    pub fn lookup(&self, id: &RecordId) -> Result<Option<Record>> {
        if let Some(r) = self.snap.head_arena.fetch_record(id) {
            return Ok(Some(r));
        }
        if let Some(r) = self.snap.compacting_arena.as_ref().and_then(|a| a.fetch_record(id)) {
            return Ok(Some(r));
        }

        for t in self.snap.state.lsm_tables.iter().rev() {
            let idx = self.idx_cache.lookup(&self.snap.index_path(&t.filename))?;
            let Some(version) = idx.get(id) else {
                continue;
            };

            let mut scanner =
                TableScanner::open(&self.snap.table_path(&t.filename), self.table.schema())?;
            while let Some(key) = scanner.next_key()? {
                if key.record_id == *id && key.version == version {
                    return scanner.read_record(&key).map(Some);
                }
                scanner.skip_payload()?;
            }
        }
        Ok(None)
    }

    /// Calls `f` with every committed row whose sequence is greater than
    /// `from_sequence`, in sequence order. In-memory records are not included.
    pub fn fetch_records_since<F>(&self, from_sequence: u64, mut f: F) -> Result<()>
    where
        F: FnMut(u64, &Record) -> Result<()>,
    {
        let schema = self.table.schema();
        for t in self
            .snap
            .state
            .lsm_tables
            .iter()
            .filter(|t| t.last_sequence > from_sequence)
        {
            let mut scanner =
                TableScanner::open(&self.snap.table_path(&t.filename), schema.clone())?;
            while let Some(key) = scanner.next_key()? {
                if key.sequence > from_sequence {
                    f(key.sequence, &scanner.read_record(&key)?)?;
                } else {
                    scanner.skip_payload()?;
                }
            }
        }
        Ok(())
    }

    /// Number of live records. Walks every table file.
    pub fn count_records(&self) -> Result<u64> {
        let mut n = 0;
        self.fetch_records(|_| {
            n += 1;
            Ok(())
        })?;
        Ok(n)
    }
}

/// Reader over the single column table of a static partition.
pub struct StaticPartitionReader {
    snap: Arc<PartitionSnapshot>,
    table: Arc<Table>,
}

impl StaticPartitionReader {
    pub fn new(snap: Arc<PartitionSnapshot>, table: Arc<Table>) -> Self {
        Self { snap, table }
    }

    /// Path of the installed column table, `None` before the first upload.
    pub fn cstable_filename(&self) -> Option<PathBuf> {
        if self.snap.state.cstable_version == 0 {
            return None;
        }
        Some(self.snap.base_path.join(STATIC_TABLE_FILENAME))
    }

    pub fn cstable_version(&self) -> u64 {
        self.snap.state.cstable_version
    }

    pub fn fetch_records<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&MessageObject) -> Result<()>,
    {
        let Some(path) = self.cstable_filename() else {
            return Ok(());
        };
        let reader = CsTableReader::open(&path)?;
        let mut rows = RecordMaterializer::new(&self.table.schema(), &reader)?;
        while rows.remaining() > 0 {
            f(&rows.next_record()?)?;
        }
        Ok(())
    }
}
