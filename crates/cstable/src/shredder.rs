//! Conversion between row-oriented [`MessageObject`]s and column streams.

use anyhow::{bail, Result};
use msg::{Field, MessageObject, MessageSchema, Value};

use crate::{ColumnReader, ColumnValue, ColumnWriter, CsTableReader, CsTableWriter, CsTableError};

impl From<&Value> for ColumnValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Bool(b) => ColumnValue::Bool(*b),
            Value::UInt64(n) => ColumnValue::UInt(*n),
            Value::Int64(n) => ColumnValue::Int(*n),
            Value::Double(n) => ColumnValue::Float(*n),
            Value::String(s) => ColumnValue::String(s.clone()),
        }
    }
}

impl ColumnValue {
    /// Converts back into a message value. `Null` has no message form.
    pub fn into_value(self) -> Option<Value> {
        match self {
            ColumnValue::Null => None,
            ColumnValue::Bool(b) => Some(Value::Bool(b)),
            ColumnValue::UInt(n) => Some(Value::UInt64(n)),
            ColumnValue::Int(n) => Some(Value::Int64(n)),
            ColumnValue::Float(n) => Some(Value::Double(n)),
            ColumnValue::String(s) => Some(Value::String(s)),
        }
    }
}

/// Splits message objects into the columns of a [`CsTableWriter`].
///
/// The shredder only appends column entries; the caller still marks the row
/// boundary with [`CsTableWriter::add_row`].
pub struct RecordShredder {
    columns: Vec<(Field, ColumnWriter)>,
}

impl RecordShredder {
    pub fn new(writer: &CsTableWriter, schema: &MessageSchema) -> Result<Self> {
        let columns = schema
            .fields()
            .iter()
            .map(|f| Ok((f.clone(), writer.column_writer(&f.name)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { columns })
    }

    pub fn add_record(&self, obj: &MessageObject) -> Result<()> {
        for (field, column) in &self.columns {
            let dmax = column.config().dlevel_max;
            let mut rep = 0u8;
            let mut written = false;

            for value in obj.values(field.id) {
                if written && !field.repeated {
                    bail!("field '{}' is not repeated but has multiple values", field.name);
                }
                column.write_entry(rep, dmax, ColumnValue::from(value))?;
                rep = column.config().rlevel_max;
                written = true;
            }

            if !written {
                if dmax == 0 {
                    bail!("missing required field '{}'", field.name);
                }
                column.write_null(0, 0)?;
            }
        }
        Ok(())
    }
}

/// Reassembles message objects row by row from a [`CsTableReader`].
///
/// Fields with no matching column (added to the schema after the file was
/// written) are left out of the materialized objects.
pub struct RecordMaterializer {
    columns: Vec<(u32, Option<ColumnReader>)>,
    remaining: u64,
}

impl RecordMaterializer {
    pub fn new(schema: &MessageSchema, reader: &CsTableReader) -> Result<Self> {
        let mut columns = Vec::with_capacity(schema.fields().len());
        for field in schema.fields() {
            let column = if reader.has_column(&field.name) {
                Some(reader.column_reader(&field.name)?)
            } else {
                None
            };
            columns.push((field.id, column));
        }
        Ok(Self {
            columns,
            remaining: reader.num_records(),
        })
    }

    /// Rows not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn next_record(&mut self) -> Result<MessageObject> {
        self.check_remaining()?;
        let mut obj = MessageObject::new();
        for (id, column) in self.columns.iter_mut() {
            let Some(column) = column else { continue };
            loop {
                let (_, _, value) = column.read_entry()?;
                if let Some(v) = value.into_value() {
                    obj.push(*id, v);
                }
                if column.next_repetition_level() == 0 {
                    break;
                }
            }
        }
        self.remaining -= 1;
        Ok(obj)
    }

    pub fn skip_record(&mut self) -> Result<()> {
        self.check_remaining()?;
        for column in self.columns.iter_mut().filter_map(|(_, c)| c.as_mut()) {
            loop {
                column.skip_value()?;
                if column.next_repetition_level() == 0 {
                    break;
                }
            }
        }
        self.remaining -= 1;
        Ok(())
    }

    fn check_remaining(&self) -> Result<()> {
        if self.remaining == 0 {
            return Err(CsTableError::EndOfColumn("<all>".to_string()).into());
        }
        Ok(())
    }
}
