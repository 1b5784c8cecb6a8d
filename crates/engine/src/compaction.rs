//! Compaction: merges a partition's table files into one, keeping only the
//! live version of every record id.
//!
//! Table files are ordered by sequence, not by id, so this is not a sorted
//! k-way merge. Instead the strategy first builds the winning `id -> version`
//! map from the tables' indexes (newest table first, first sighting wins) and
//! then streams every input table in sequence order, copying a row only if
//! its version is the winner.

use anyhow::Result;
use arena::Sha1Hash;
use cstable::{BinaryFormatVersion, ColumnReader, ColumnWriter, CsTableReader, CsTableWriter};
use lsmidx::{IndexCache, LsmTableIndex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::lsm_table::{
    lsm_table_schema, random_filename, LSM_ID_COLUMN, LSM_IS_UPDATE_COLUMN, LSM_SEQUENCE_COLUMN,
    LSM_VERSION_COLUMN,
};
use crate::state::LsmTableRef;
use crate::table::Table;
use crate::PartitionError;

/// Decides when and how a partition's table list is merged.
pub trait CompactionStrategy: Send + Sync {
    fn needs_compaction(&self, tables: &[LsmTableRef]) -> bool;

    /// Urgent compaction runs inline on the insert path.
    fn needs_urgent_compaction(&self, tables: &[LsmTableRef]) -> bool;

    /// Merges `input` into new table files appended to `output`.
    ///
    /// Returns `false` without touching the disk if there is nothing to do.
    /// Input files are left in place; deleting them is the caller's job once
    /// the new table list has been installed.
    fn compact(&self, input: &[LsmTableRef], output: &mut Vec<LsmTableRef>) -> Result<bool>;
}

/// Merges all tables into one once their count exceeds `soft_limit`.
pub struct SimpleCompactionStrategy {
    table: Arc<Table>,
    base_path: PathBuf,
    idx_cache: Arc<IndexCache>,
    soft_limit: usize,
    hard_limit: usize,
}

impl SimpleCompactionStrategy {
    pub fn new(
        table: Arc<Table>,
        base_path: PathBuf,
        idx_cache: Arc<IndexCache>,
        soft_limit: usize,
        hard_limit: usize,
    ) -> Self {
        Self {
            table,
            base_path,
            idx_cache,
            soft_limit,
            hard_limit,
        }
    }

    fn table_path(&self, filename: &str) -> PathBuf {
        self.base_path.join(format!("{}.cst", filename))
    }

    fn index_path(&self, filename: &str) -> PathBuf {
        self.base_path.join(format!("{}.idx", filename))
    }
}

impl CompactionStrategy for SimpleCompactionStrategy {
    fn needs_compaction(&self, tables: &[LsmTableRef]) -> bool {
        tables.len() > self.soft_limit
    }

    fn needs_urgent_compaction(&self, tables: &[LsmTableRef]) -> bool {
        tables.len() > self.hard_limit
    }

    fn compact(&self, input: &[LsmTableRef], output: &mut Vec<LsmTableRef>) -> Result<bool> {
        let (Some(first), Some(last)) = (input.first(), input.last()) else {
            return Ok(false);
        };
        if !self.needs_compaction(input) {
            return Ok(false);
        }

        let mut vmap = HashMap::new();
        for t in input.iter().rev() {
            self.idx_cache
                .lookup(&self.index_path(&t.filename))?
                .list(&mut vmap);
        }

        let schema = self.table.schema();
        let cst_schema = lsm_table_schema(&schema);
        let filename = random_filename();
        let table_path = self.table_path(&filename);

        let mut writer =
            CsTableWriter::create(&table_path, BinaryFormatVersion::V0_1_0, cst_schema.clone())?;
        let is_update_col = writer.column_writer(LSM_IS_UPDATE_COLUMN)?;
        let id_col = writer.column_writer(LSM_ID_COLUMN)?;
        let version_col = writer.column_writer(LSM_VERSION_COLUMN)?;
        let sequence_col = writer.column_writer(LSM_SEQUENCE_COLUMN)?;

        let data_columns: Vec<_> = schema
            .fields()
            .iter()
            .map(|f| {
                cst_schema
                    .column(&f.name)
                    .cloned()
                    .ok_or_else(|| {
                        PartitionError::Corrupt(format!("no column for field {}", f.name))
                    })
            })
            .collect::<Result<_, _>>()?;

        let mut emitted = HashSet::new();
        let mut out_vmap = BTreeMap::new();
        let mut rows_in = 0u64;

        for t in input {
            let reader = CsTableReader::open(self.table_path(&t.filename))?;
            rows_in += reader.num_records();

            let mut id_in = reader.column_reader(LSM_ID_COLUMN)?;
            let mut version_in = reader.column_reader(LSM_VERSION_COLUMN)?;
            let mut sequence_in = reader.column_reader(LSM_SEQUENCE_COLUMN)?;

            let mut columns: Vec<(Option<ColumnReader>, ColumnWriter)> =
                Vec::with_capacity(data_columns.len());
            for col in &data_columns {
                let column_reader = if reader.has_column(&col.column_name) {
                    Some(reader.column_reader(&col.column_name)?)
                } else if col.dlevel_max > 0 {
                    None
                } else {
                    return Err(PartitionError::SchemaIncompatible(col.column_name.clone()).into());
                };
                columns.push((column_reader, writer.column_writer(&col.column_name)?));
            }

            for _ in 0..reader.num_records() {
                let (_, _, id) = id_in.read_string()?;
                let (_, _, version) = version_in.read_uint()?;
                let (_, _, sequence) = sequence_in.read_uint()?;

                let id = id
                    .as_deref()
                    .and_then(Sha1Hash::from_slice)
                    .ok_or_else(|| {
                        PartitionError::Corrupt(format!("invalid record id in {}", t.filename))
                    })?;
                let version = version.unwrap_or(0);

                let Some(&live_version) = vmap.get(&id) else {
                    return Err(PartitionError::Corrupt(format!(
                        "invalid cstable contents: id {} in {} missing from index",
                        id, t.filename
                    ))
                    .into());
                };
                let is_live = live_version == version && emitted.insert(id);
                for (column_reader, column_writer) in columns.iter_mut() {
                    match column_reader {
                        Some(r) if is_live => loop {
                            r.copy_value(column_writer)?;
                            if r.next_repetition_level() == 0 {
                                break;
                            }
                        },
                        Some(r) => loop {
                            r.skip_value()?;
                            if r.next_repetition_level() == 0 {
                                break;
                            }
                        },
                        None if is_live => column_writer.write_null(0, 0)?,
                        None => {}
                    }
                }

                if !is_live {
                    continue;
                }
                is_update_col.write_bool(0, 0, false)?;
                id_col.write_string(0, 0, id.as_bytes())?;
                version_col.write_uint(0, 0, version)?;
                sequence_col.write_uint(0, 0, sequence.unwrap_or(0))?;
                writer.add_row();
                out_vmap.insert(id, version);
            }
        }

        let rows_out = writer.num_records();
        writer.commit()?;
        let index_path = self.index_path(&filename);
        if let Err(e) = LsmTableIndex::write(&out_vmap, &index_path) {
            let _ = std::fs::remove_file(&table_path);
            return Err(e);
        }

        debug!(
            table = %self.table.name(),
            input_tables = input.len(),
            rows_in,
            rows_out,
            file = %filename,
            "merged tables"
        );

        output.push(LsmTableRef {
            filename,
            first_sequence: first.first_sequence,
            last_sequence: last.last_sequence,
        });
        Ok(true)
    }
}
