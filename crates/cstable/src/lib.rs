//! # CSTable - Column-Striped Tables
//!
//! Immutable, column-oriented files holding the committed rows of a
//! partition. Every flush of a record arena and every compaction produces one
//! `.cst` file. Files are *write-once, read-many*: they are never modified,
//! only replaced by compaction.
//!
//! Each column stores a stream of `(repetition level, definition level,
//! value)` entries. Flat schemas only need two repetition levels: `0` starts
//! a new row, `1` continues a repeated field inside the current row. A value
//! is present iff its definition level equals the column's `dlevel_max`;
//! anything lower is a null.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ HEADER                                                         │
//! │ magic (u32 LE) "CST1" | format_version (u16 LE)                │
//! │ num_records (u64 LE) | num_columns (u32 LE)                    │
//! ├───────────────────────────────────────────────────────────────┤
//! │ COLUMNS (repeated num_columns times)                           │
//! │                                                               │
//! │ name_len (u32) | name | type (u8) | rmax (u8) | dmax (u8)      │
//! │ num_entries (u64)                                              │
//! │ entries: rep (u8) | def (u8) | [value if def == dmax]          │
//! ├───────────────────────────────────────────────────────────────┤
//! │ TRAILER                                                        │
//! │ crc32 (u32 LE) over every preceding byte                       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Values are `u8` (bool), `u64`/`i64`/`f64` LE, or `[len: u32][bytes]`
//! (string). Files are written to `<path>.tmp`, fsynced and renamed into
//! place.

mod format;
mod reader;
mod schema;
mod shredder;
mod writer;

pub use format::{BinaryFormatVersion, CSTABLE_MAGIC};
pub use reader::{ColumnReader, CsTableReader};
pub use schema::{ColumnConfig, ColumnType, TableSchema};
pub use shredder::{RecordMaterializer, RecordShredder};
pub use writer::{ColumnWriter, CsTableWriter};

use thiserror::Error;

/// A single value slot in a column stream. `Null` marks an undefined value
/// (definition level below the column maximum).
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    String(Vec<u8>),
}

/// Errors specific to the column table format.
#[derive(Debug, Error)]
pub enum CsTableError {
    #[error("not a cstable file (bad magic {0:#010x})")]
    BadMagic(u32),

    #[error("unsupported cstable format version {0}")]
    UnsupportedVersion(u16),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("no such column: {0}")]
    UnknownColumn(String),

    #[error("column '{column}' has type {expected:?}, cannot store {found:?}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        found: ColumnType,
    },

    #[error("column '{column}': invalid levels rep={rep} def={def} (rmax={rmax}, dmax={dmax})")]
    InvalidLevels {
        column: String,
        rep: u8,
        def: u8,
        rmax: u8,
        dmax: u8,
    },

    #[error("column '{0}' reached end of stream")]
    EndOfColumn(String),

    #[error("corrupt cstable: {0}")]
    Corrupt(String),
}
