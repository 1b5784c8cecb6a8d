use msg::{FieldType, MessageSchema};

use crate::ColumnValue;

/// Physical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    UnsignedInt,
    SignedInt,
    Float,
    String,
}

impl ColumnType {
    pub(crate) fn tag(self) -> u8 {
        match self {
            ColumnType::Boolean => 0,
            ColumnType::UnsignedInt => 1,
            ColumnType::SignedInt => 2,
            ColumnType::Float => 3,
            ColumnType::String => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ColumnType::Boolean),
            1 => Some(ColumnType::UnsignedInt),
            2 => Some(ColumnType::SignedInt),
            3 => Some(ColumnType::Float),
            4 => Some(ColumnType::String),
            _ => None,
        }
    }

    pub(crate) fn of_value(value: &ColumnValue) -> Option<Self> {
        match value {
            ColumnValue::Null => None,
            ColumnValue::Bool(_) => Some(ColumnType::Boolean),
            ColumnValue::UInt(_) => Some(ColumnType::UnsignedInt),
            ColumnValue::Int(_) => Some(ColumnType::SignedInt),
            ColumnValue::Float(_) => Some(ColumnType::Float),
            ColumnValue::String(_) => Some(ColumnType::String),
        }
    }
}

impl From<FieldType> for ColumnType {
    fn from(t: FieldType) -> Self {
        match t {
            FieldType::Bool => ColumnType::Boolean,
            FieldType::UInt64 => ColumnType::UnsignedInt,
            FieldType::Int64 => ColumnType::SignedInt,
            FieldType::Double => ColumnType::Float,
            FieldType::String => ColumnType::String,
        }
    }
}

/// A flat column declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnConfig {
    pub column_name: String,
    pub column_type: ColumnType,
    pub rlevel_max: u8,
    pub dlevel_max: u8,
}

/// Ordered list of columns stored in one table file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSchema {
    columns: Vec<ColumnConfig>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives one column per message field.
    ///
    /// Required fields map to `dmax = 0`, optional fields to `dmax = 1`, and
    /// repeated fields to `rmax = 1, dmax = 1`.
    pub fn from_message_schema(schema: &MessageSchema) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|f| ColumnConfig {
                column_name: f.name.clone(),
                column_type: f.field_type.into(),
                rlevel_max: u8::from(f.repeated),
                dlevel_max: u8::from(!f.is_required()),
            })
            .collect();
        Self { columns }
    }

    pub fn from_columns(columns: Vec<ColumnConfig>) -> Self {
        Self { columns }
    }

    pub fn add_column(&mut self, name: impl Into<String>, column_type: ColumnType, optional: bool) {
        self.columns.push(ColumnConfig {
            column_name: name.into(),
            column_type,
            rlevel_max: 0,
            dlevel_max: u8::from(optional),
        });
    }

    pub fn add_bool(&mut self, name: impl Into<String>, optional: bool) {
        self.add_column(name, ColumnType::Boolean, optional);
    }

    pub fn add_string(&mut self, name: impl Into<String>, optional: bool) {
        self.add_column(name, ColumnType::String, optional);
    }

    pub fn add_unsigned_integer(&mut self, name: impl Into<String>, optional: bool) {
        self.add_column(name, ColumnType::UnsignedInt, optional);
    }

    pub fn flat_columns(&self) -> &[ColumnConfig] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnConfig> {
        self.columns.iter().find(|c| c.column_name == name)
    }
}
