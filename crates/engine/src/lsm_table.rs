//! On-disk layout of LSM table files.
//!
//! Every `.cst` file holds the table's data columns followed by four
//! bookkeeping columns:
//!
//! ```text
//! | <data columns ...> | __lsm_is_update | __lsm_id | __lsm_version | __lsm_sequence |
//! |                    | bool            | string   | uint          | uint           |
//! ```
//!
//! Rows are stored in ascending sequence order. The paired `.idx` file maps
//! each id in the table to the version stored for it.

use anyhow::{Context, Result};
use arena::{Record, RecordArena, RecordId, Sha1Hash};
use cstable::{
    BinaryFormatVersion, ColumnReader, CsTableReader, CsTableWriter, RecordMaterializer,
    RecordShredder, TableSchema,
};
use lsmidx::LsmTableIndex;
use msg::MessageSchema;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::PartitionError;

pub const LSM_IS_UPDATE_COLUMN: &str = "__lsm_is_update";
pub const LSM_ID_COLUMN: &str = "__lsm_id";
pub const LSM_VERSION_COLUMN: &str = "__lsm_version";
pub const LSM_SEQUENCE_COLUMN: &str = "__lsm_sequence";

/// Column schema of a table file: data columns plus bookkeeping columns.
pub fn lsm_table_schema(schema: &MessageSchema) -> TableSchema {
    let mut cst = TableSchema::from_message_schema(schema);
    cst.add_bool(LSM_IS_UPDATE_COLUMN, false);
    cst.add_string(LSM_ID_COLUMN, false);
    cst.add_unsigned_integer(LSM_VERSION_COLUMN, false);
    cst.add_unsigned_integer(LSM_SEQUENCE_COLUMN, false);
    cst
}

/// A new random table file name (16 hex chars).
pub(crate) fn random_filename() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Flushes `arena` into a new table file and its index.
///
/// Sequence numbers are assigned in arena order starting at
/// `first_sequence`. Returns the number of rows written.
pub(crate) fn write_arena_to_disk(
    arena: &RecordArena,
    schema: &MessageSchema,
    first_sequence: u64,
    table_path: &Path,
    index_path: &Path,
) -> Result<u64> {
    let mut writer =
        CsTableWriter::create(table_path, BinaryFormatVersion::V0_1_0, lsm_table_schema(schema))?;
    let shredder = RecordShredder::new(&writer, schema)?;
    let is_update_col = writer.column_writer(LSM_IS_UPDATE_COLUMN)?;
    let id_col = writer.column_writer(LSM_ID_COLUMN)?;
    let version_col = writer.column_writer(LSM_VERSION_COLUMN)?;
    let sequence_col = writer.column_writer(LSM_SEQUENCE_COLUMN)?;

    let mut vmap = BTreeMap::new();
    let mut sequence = first_sequence;

    arena.fetch_records(|r| -> Result<()> {
        let obj = msg::decode(&r.payload, schema)
            .with_context(|| format!("failed to decode record {}", r.record_id))?;
        shredder.add_record(&obj)?;
        is_update_col.write_bool(0, 0, r.is_update)?;
        id_col.write_string(0, 0, r.record_id.as_bytes())?;
        version_col.write_uint(0, 0, r.version)?;
        sequence_col.write_uint(0, 0, sequence)?;
        writer.add_row();

        vmap.insert(r.record_id, r.version);
        sequence += 1;
        Ok(())
    })?;

    let rows = writer.num_records();
    writer.commit()?;
    LsmTableIndex::write(&vmap, index_path)?;
    Ok(rows)
}

/// Bookkeeping values of one table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RowKey {
    pub record_id: RecordId,
    pub version: u64,
    pub sequence: u64,
    pub is_update: bool,
}

/// Row-at-a-time cursor over a table file.
///
/// For every key returned by [`next_key`](Self::next_key) the caller must
/// call exactly one of [`read_record`](Self::read_record) or
/// [`skip_payload`](Self::skip_payload).
pub(crate) struct TableScanner {
    schema: Arc<MessageSchema>,
    is_update: ColumnReader,
    id: ColumnReader,
    version: ColumnReader,
    sequence: ColumnReader,
    rows: RecordMaterializer,
    remaining: u64,
}

impl TableScanner {
    pub fn open(path: &Path, schema: Arc<MessageSchema>) -> Result<Self> {
        let reader = CsTableReader::open(path)?;
        Ok(Self {
            is_update: reader.column_reader(LSM_IS_UPDATE_COLUMN)?,
            id: reader.column_reader(LSM_ID_COLUMN)?,
            version: reader.column_reader(LSM_VERSION_COLUMN)?,
            sequence: reader.column_reader(LSM_SEQUENCE_COLUMN)?,
            rows: RecordMaterializer::new(&schema, &reader)?,
            remaining: reader.num_records(),
            schema,
        })
    }

    pub fn next_key(&mut self) -> Result<Option<RowKey>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        let (_, _, is_update) = self.is_update.read_bool()?;
        let (_, _, id) = self.id.read_string()?;
        let (_, _, version) = self.version.read_uint()?;
        let (_, _, sequence) = self.sequence.read_uint()?;

        let record_id = id
            .as_deref()
            .and_then(Sha1Hash::from_slice)
            .ok_or_else(|| PartitionError::Corrupt("invalid record id column".to_string()))?;

        Ok(Some(RowKey {
            record_id,
            version: version.unwrap_or(0),
            sequence: sequence.unwrap_or(0),
            is_update: is_update.unwrap_or(false),
        }))
    }

    /// Materializes the current row and re-encodes it as a payload.
    pub fn read_record(&mut self, key: &RowKey) -> Result<Record> {
        let obj = self.rows.next_record()?;
        let payload = msg::encode(&obj, &self.schema)
            .with_context(|| format!("failed to encode record {}", key.record_id))?;
        Ok(Record {
            record_id: key.record_id,
            version: key.version,
            payload,
            is_update: key.is_update,
        })
    }

    pub fn skip_payload(&mut self) -> Result<()> {
        self.rows.skip_record()
    }
}
