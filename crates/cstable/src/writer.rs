use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::cell::RefCell;
use std::fs::{rename, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::format::{write_value, BinaryFormatVersion, ColumnEntry, CSTABLE_MAGIC};
use crate::{ColumnConfig, ColumnType, ColumnValue, CsTableError, TableSchema};

#[derive(Debug)]
struct ColumnBuffer {
    config: ColumnConfig,
    entries: Vec<ColumnEntry>,
}

/// Append handle for a single column of a [`CsTableWriter`].
///
/// Handles are cheap to clone and all point at the same buffer.
#[derive(Debug, Clone)]
pub struct ColumnWriter {
    column: Rc<RefCell<ColumnBuffer>>,
}

impl ColumnWriter {
    pub fn config(&self) -> ColumnConfig {
        self.column.borrow().config.clone()
    }

    pub fn write_bool(&self, rep: u8, def: u8, value: bool) -> Result<()> {
        self.write_entry(rep, def, ColumnValue::Bool(value))
    }

    pub fn write_uint(&self, rep: u8, def: u8, value: u64) -> Result<()> {
        self.write_entry(rep, def, ColumnValue::UInt(value))
    }

    pub fn write_int(&self, rep: u8, def: u8, value: i64) -> Result<()> {
        self.write_entry(rep, def, ColumnValue::Int(value))
    }

    pub fn write_double(&self, rep: u8, def: u8, value: f64) -> Result<()> {
        self.write_entry(rep, def, ColumnValue::Float(value))
    }

    pub fn write_string(&self, rep: u8, def: u8, value: &[u8]) -> Result<()> {
        self.write_entry(rep, def, ColumnValue::String(value.to_vec()))
    }

    /// Writes an undefined value. `def` must be below the column's `dlevel_max`.
    pub fn write_null(&self, rep: u8, def: u8) -> Result<()> {
        self.write_entry(rep, def, ColumnValue::Null)
    }

    /// Appends a raw entry after validating its levels and type.
    pub fn write_entry(&self, rep: u8, def: u8, value: ColumnValue) -> Result<()> {
        let mut col = self.column.borrow_mut();
        let cfg = &col.config;

        let levels_ok = rep <= cfg.rlevel_max
            && match value {
                ColumnValue::Null => def < cfg.dlevel_max,
                _ => def == cfg.dlevel_max,
            };
        if !levels_ok {
            return Err(CsTableError::InvalidLevels {
                column: cfg.column_name.clone(),
                rep,
                def,
                rmax: cfg.rlevel_max,
                dmax: cfg.dlevel_max,
            }
            .into());
        }

        if let Some(found) = ColumnType::of_value(&value) {
            if found != cfg.column_type {
                return Err(CsTableError::TypeMismatch {
                    column: cfg.column_name.clone(),
                    expected: cfg.column_type,
                    found,
                }
                .into());
            }
        }

        col.entries.push(ColumnEntry { rep, def, value });
        Ok(())
    }
}

/// Builds a column table in memory and persists it on [`commit`](Self::commit).
///
/// Callers obtain a [`ColumnWriter`] per column, write one row worth of
/// entries into every column and then call [`add_row`](Self::add_row).
///
/// # Crash Safety
///
/// `commit` writes to `<path>.tmp`, calls `sync_all()`, renames the file into
/// place and fsyncs the parent directory. A crash mid-write leaves only the
/// temp file behind.
pub struct CsTableWriter {
    path: PathBuf,
    version: BinaryFormatVersion,
    schema: TableSchema,
    columns: Vec<ColumnWriter>,
    num_records: u64,
}

impl CsTableWriter {
    /// Prepares a new table that will be written to `path` on commit.
    pub fn create<P: AsRef<Path>>(
        path: P,
        version: BinaryFormatVersion,
        schema: TableSchema,
    ) -> Result<Self> {
        let columns = schema
            .flat_columns()
            .iter()
            .map(|config| ColumnWriter {
                column: Rc::new(RefCell::new(ColumnBuffer {
                    config: config.clone(),
                    entries: Vec::new(),
                })),
            })
            .collect();

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            version,
            schema,
            columns,
            num_records: 0,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn column_writer(&self, name: &str) -> Result<ColumnWriter> {
        self.schema
            .flat_columns()
            .iter()
            .position(|c| c.column_name == name)
            .map(|i| self.columns[i].clone())
            .ok_or_else(|| CsTableError::UnknownColumn(name.to_string()).into())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.schema.column(name).is_some()
    }

    /// Marks the end of the current row.
    pub fn add_row(&mut self) {
        self.num_records += 1;
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    /// Serializes all columns and atomically moves the file into place.
    ///
    /// # Errors
    ///
    /// Fails if any column holds a different number of rows than were added
    /// with [`add_row`](Self::add_row), or on I/O failure.
    pub fn commit(self) -> Result<()> {
        for col in &self.columns {
            let col = col.column.borrow();
            let rows = col.entries.iter().filter(|e| e.rep == 0).count() as u64;
            if rows != self.num_records {
                return Err(CsTableError::Corrupt(format!(
                    "column '{}' holds {} rows, expected {}",
                    col.config.column_name, rows, self.num_records
                ))
                .into());
            }
        }

        let tmp_path = tmp_path_for(&self.path);
        let raw_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        let mut file = CrcWriter::new(BufWriter::new(raw_file));

        file.write_u32::<LittleEndian>(CSTABLE_MAGIC)?;
        file.write_u16::<LittleEndian>(self.version.as_u16())?;
        file.write_u64::<LittleEndian>(self.num_records)?;
        file.write_u32::<LittleEndian>(self.columns.len() as u32)?;

        for col in &self.columns {
            let col = col.column.borrow();
            let name = col.config.column_name.as_bytes();
            file.write_u32::<LittleEndian>(name.len() as u32)?;
            file.write_all(name)?;
            file.write_u8(col.config.column_type.tag())?;
            file.write_u8(col.config.rlevel_max)?;
            file.write_u8(col.config.dlevel_max)?;
            file.write_u64::<LittleEndian>(col.entries.len() as u64)?;

            for entry in &col.entries {
                file.write_u8(entry.rep)?;
                file.write_u8(entry.def)?;
                if entry.def == col.config.dlevel_max {
                    write_value(&mut file, &entry.value)?;
                }
            }
        }

        let (mut inner, crc) = file.finish();
        inner.write_u32::<LittleEndian>(crc)?;
        inner.flush()?;
        inner.into_inner()?.sync_all()?;

        rename(&tmp_path, &self.path)?;

        // Make the rename itself durable.
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write adapter that checksums every byte passing through it.
struct CrcWriter<W: Write> {
    inner: W,
    hasher: Crc32,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Crc32::new(),
        }
    }

    fn finish(self) -> (W, u32) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
