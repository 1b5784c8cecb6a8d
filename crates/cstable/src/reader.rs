use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use crc32fast::Hasher as Crc32;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::format::{read_value, BinaryFormatVersion, ColumnEntry, CSTABLE_MAGIC, MAX_NAME_BYTES};
use crate::{ColumnConfig, ColumnType, ColumnValue, ColumnWriter, CsTableError, TableSchema};

/// Smallest possible file: header (4 + 2 + 8 + 4) + crc trailer (4).
const MIN_FILE_BYTES: usize = 22;

#[derive(Debug)]
struct ColumnData {
    config: ColumnConfig,
    entries: Vec<ColumnEntry>,
}

/// Reads a column table file.
///
/// On [`open`](CsTableReader::open) the whole file is loaded and its
/// checksum verified, so corruption is reported before any row is consumed.
/// Column cursors obtained via [`column_reader`](CsTableReader::column_reader)
/// are independent of each other and of the table handle.
#[derive(Debug)]
pub struct CsTableReader {
    path: PathBuf,
    version: BinaryFormatVersion,
    num_records: u64,
    columns: Vec<Arc<ColumnData>>,
    by_name: HashMap<String, usize>,
}

impl CsTableReader {
    /// Opens and validates a column table file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, truncated, carries the wrong
    /// magic or format version, or fails its CRC32 check.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)
            .with_context(|| format!("failed to read cstable {}", path.display()))?;

        if data.len() < MIN_FILE_BYTES {
            return Err(
                CsTableError::Corrupt(format!("file too small ({} bytes)", data.len())).into(),
            );
        }

        let (body, trailer) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let mut hasher = Crc32::new();
        hasher.update(body);
        let actual = hasher.finalize();
        if actual != expected {
            return Err(CsTableError::ChecksumMismatch { expected, actual }.into());
        }

        let mut r = body;
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != CSTABLE_MAGIC {
            return Err(CsTableError::BadMagic(magic).into());
        }
        let version = BinaryFormatVersion::from_u16(r.read_u16::<LittleEndian>()?)?;
        let num_records = r.read_u64::<LittleEndian>()?;
        let num_columns = r.read_u32::<LittleEndian>()? as usize;

        let mut columns = Vec::with_capacity(num_columns.min(1024));
        let mut by_name = HashMap::new();

        for i in 0..num_columns {
            let config = read_column_config(&mut r)?;
            let num_entries = r.read_u64::<LittleEndian>()?;

            let mut entries = Vec::new();
            for _ in 0..num_entries {
                let rep = r.read_u8()?;
                let def = r.read_u8()?;
                if rep > config.rlevel_max || def > config.dlevel_max {
                    return Err(CsTableError::InvalidLevels {
                        column: config.column_name.clone(),
                        rep,
                        def,
                        rmax: config.rlevel_max,
                        dmax: config.dlevel_max,
                    }
                    .into());
                }
                let value = if def == config.dlevel_max {
                    read_value(&mut r, config.column_type)?
                } else {
                    ColumnValue::Null
                };
                entries.push(ColumnEntry { rep, def, value });
            }

            by_name.insert(config.column_name.clone(), i);
            columns.push(Arc::new(ColumnData { config, entries }));
        }

        if !r.is_empty() {
            return Err(CsTableError::Corrupt(format!("{} trailing bytes", r.len())).into());
        }

        Ok(Self {
            path,
            version,
            num_records,
            columns,
            by_name,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format_version(&self) -> BinaryFormatVersion {
        self.version
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Reconstructs the schema the file was written with.
    pub fn schema(&self) -> TableSchema {
        TableSchema::from_columns(self.columns.iter().map(|c| c.config.clone()).collect())
    }

    /// Returns a fresh cursor positioned at the first entry of `name`.
    pub fn column_reader(&self, name: &str) -> Result<ColumnReader> {
        let idx = self
            .by_name
            .get(name)
            .ok_or_else(|| CsTableError::UnknownColumn(name.to_string()))?;
        Ok(ColumnReader {
            data: self.columns[*idx].clone(),
            pos: 0,
        })
    }
}

fn read_column_config(r: &mut &[u8]) -> Result<ColumnConfig> {
    let name_len = r.read_u32::<LittleEndian>()? as usize;
    if name_len > MAX_NAME_BYTES {
        return Err(CsTableError::Corrupt(format!("column name length {}", name_len)).into());
    }
    let mut name = vec![0u8; name_len];
    r.read_exact(&mut name)?;
    let column_name = String::from_utf8(name)
        .map_err(|_| CsTableError::Corrupt("column name is not utf-8".to_string()))?;

    let tag = r.read_u8()?;
    let column_type = ColumnType::from_tag(tag)
        .ok_or_else(|| CsTableError::Corrupt(format!("unknown column type {}", tag)))?;
    let rlevel_max = r.read_u8()?;
    let dlevel_max = r.read_u8()?;

    Ok(ColumnConfig {
        column_name,
        column_type,
        rlevel_max,
        dlevel_max,
    })
}

/// Sequential cursor over one column.
#[derive(Debug, Clone)]
pub struct ColumnReader {
    data: Arc<ColumnData>,
    pos: usize,
}

impl ColumnReader {
    pub fn config(&self) -> &ColumnConfig {
        &self.data.config
    }

    pub fn eof_reached(&self) -> bool {
        self.pos >= self.data.entries.len()
    }

    /// Repetition level of the next entry, `0` at end of stream.
    pub fn next_repetition_level(&self) -> u8 {
        self.data.entries.get(self.pos).map(|e| e.rep).unwrap_or(0)
    }

    /// Reads the next raw `(rep, def, value)` entry.
    pub fn read_entry(&mut self) -> Result<(u8, u8, ColumnValue)> {
        let entry = self
            .data
            .entries
            .get(self.pos)
            .ok_or_else(|| CsTableError::EndOfColumn(self.data.config.column_name.clone()))?;
        self.pos += 1;
        Ok((entry.rep, entry.def, entry.value.clone()))
    }

    pub fn read_bool(&mut self) -> Result<(u8, u8, Option<bool>)> {
        self.read_typed(ColumnType::Boolean, |v| match v {
            ColumnValue::Bool(b) => Some(b),
            _ => None,
        })
    }

    pub fn read_uint(&mut self) -> Result<(u8, u8, Option<u64>)> {
        self.read_typed(ColumnType::UnsignedInt, |v| match v {
            ColumnValue::UInt(n) => Some(n),
            _ => None,
        })
    }

    pub fn read_int(&mut self) -> Result<(u8, u8, Option<i64>)> {
        self.read_typed(ColumnType::SignedInt, |v| match v {
            ColumnValue::Int(n) => Some(n),
            _ => None,
        })
    }

    pub fn read_double(&mut self) -> Result<(u8, u8, Option<f64>)> {
        self.read_typed(ColumnType::Float, |v| match v {
            ColumnValue::Float(n) => Some(n),
            _ => None,
        })
    }

    pub fn read_string(&mut self) -> Result<(u8, u8, Option<Vec<u8>>)> {
        self.read_typed(ColumnType::String, |v| match v {
            ColumnValue::String(s) => Some(s),
            _ => None,
        })
    }

    /// Copies the next entry, levels included, into `writer`.
    pub fn copy_value(&mut self, writer: &ColumnWriter) -> Result<()> {
        let (rep, def, value) = self.read_entry()?;
        writer.write_entry(rep, def, value)
    }

    /// Advances past the next entry without materializing it.
    pub fn skip_value(&mut self) -> Result<()> {
        if self.eof_reached() {
            return Err(CsTableError::EndOfColumn(self.data.config.column_name.clone()).into());
        }
        self.pos += 1;
        Ok(())
    }

    fn read_typed<T>(
        &mut self,
        requested: ColumnType,
        extract: impl FnOnce(ColumnValue) -> Option<T>,
    ) -> Result<(u8, u8, Option<T>)> {
        let column_type = self.data.config.column_type;
        if column_type != requested {
            return Err(CsTableError::TypeMismatch {
                column: self.data.config.column_name.clone(),
                expected: column_type,
                found: requested,
            }
            .into());
        }
        let (rep, def, value) = self.read_entry()?;
        Ok((rep, def, extract(value)))
    }
}
