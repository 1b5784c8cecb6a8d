//! Binary format constants and the primitive entry codec shared by the writer
//! and the reader.

use anyhow::{bail, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::{ColumnType, ColumnValue, CsTableError};

/// Magic number identifying column table files (ASCII "CST1").
pub const CSTABLE_MAGIC: u32 = 0x4353_5431;

/// Maximum string value size we'll allocate during reads (64 MiB).
pub(crate) const MAX_STRING_BYTES: usize = 64 * 1024 * 1024;

/// Maximum column name size we'll allocate during reads.
pub(crate) const MAX_NAME_BYTES: usize = 4096;

/// On-disk format revision written into the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormatVersion {
    V0_1_0,
}

impl BinaryFormatVersion {
    pub fn as_u16(self) -> u16 {
        match self {
            BinaryFormatVersion::V0_1_0 => 1,
        }
    }

    pub fn from_u16(v: u16) -> Result<Self, CsTableError> {
        match v {
            1 => Ok(BinaryFormatVersion::V0_1_0),
            other => Err(CsTableError::UnsupportedVersion(other)),
        }
    }
}

/// Writes the value payload of a defined entry.
pub(crate) fn write_value<W: Write>(w: &mut W, value: &ColumnValue) -> Result<()> {
    match value {
        ColumnValue::Null => bail!("null values carry no payload"),
        ColumnValue::Bool(b) => w.write_u8(u8::from(*b))?,
        ColumnValue::UInt(v) => w.write_u64::<LittleEndian>(*v)?,
        ColumnValue::Int(v) => w.write_i64::<LittleEndian>(*v)?,
        ColumnValue::Float(v) => w.write_f64::<LittleEndian>(*v)?,
        ColumnValue::String(s) => {
            w.write_u32::<LittleEndian>(s.len() as u32)?;
            w.write_all(s)?;
        }
    }
    Ok(())
}

/// Reads the value payload of a defined entry of `column_type`.
pub(crate) fn read_value<R: Read>(r: &mut R, column_type: ColumnType) -> Result<ColumnValue> {
    let value = match column_type {
        ColumnType::Boolean => ColumnValue::Bool(r.read_u8()? != 0),
        ColumnType::UnsignedInt => ColumnValue::UInt(r.read_u64::<LittleEndian>()?),
        ColumnType::SignedInt => ColumnValue::Int(r.read_i64::<LittleEndian>()?),
        ColumnType::Float => ColumnValue::Float(r.read_f64::<LittleEndian>()?),
        ColumnType::String => {
            let len = r.read_u32::<LittleEndian>()? as usize;
            if len > MAX_STRING_BYTES {
                return Err(CsTableError::Corrupt(format!(
                    "string length {} exceeds maximum {}",
                    len, MAX_STRING_BYTES
                ))
                .into());
            }
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            ColumnValue::String(buf)
        }
    };
    Ok(value)
}

/// One `(rep, def, value)` slot of a column stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ColumnEntry {
    pub rep: u8,
    pub def: u8,
    pub value: ColumnValue,
}
