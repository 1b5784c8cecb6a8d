//! # msg - Row Codec
//!
//! Schema-driven, field-tag based encoding for the rows stored in a
//! partition. Callers hand the engine opaque payloads; at flush time the
//! engine decodes each payload against the table's [`MessageSchema`] and
//! shreds the resulting [`MessageObject`] into column tables.
//!
//! ## Binary Field Format
//!
//! ```text
//! [field_id: u32 LE][type_tag: u8][payload ...]
//! ```
//!
//! | type     | tag | payload                     |
//! |----------|-----|-----------------------------|
//! | Bool     | 0   | `u8` (0 or 1)               |
//! | UInt64   | 1   | `u64 LE`                    |
//! | Int64    | 2   | `i64 LE`                    |
//! | Double   | 3   | `f64 LE`                    |
//! | String   | 4   | `[len: u32 LE][bytes]`      |
//!
//! A message is the concatenation of its fields. Repeated fields appear once
//! per element. Encoding is canonical: fields are written in the order they
//! appear in the object.
//!
//! ## Example
//!
//! ```rust
//! use msg::{FieldType, MessageObject, MessageSchema, Value};
//!
//! let mut schema = MessageSchema::new("event");
//! schema.add_field(1, "name", FieldType::String, false, false);
//!
//! let mut obj = MessageObject::new();
//! obj.push(1, Value::String(b"click".to_vec()));
//!
//! let bytes = msg::encode(&obj, &schema).unwrap();
//! assert_eq!(msg::decode(&bytes, &schema).unwrap(), obj);
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io;

use thiserror::Error;

/// Maximum string field size accepted by the decoder (64 MiB). Prevents OOM
/// on corrupt payloads.
const MAX_STRING_BYTES: usize = 64 * 1024 * 1024;

/// Scalar type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    UInt64,
    Int64,
    Double,
    String,
}

impl FieldType {
    fn tag(self) -> u8 {
        match self {
            FieldType::Bool => 0,
            FieldType::UInt64 => 1,
            FieldType::Int64 => 2,
            FieldType::Double => 3,
            FieldType::String => 4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FieldType::Bool),
            1 => Some(FieldType::UInt64),
            2 => Some(FieldType::Int64),
            3 => Some(FieldType::Double),
            4 => Some(FieldType::String),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Bool => "bool",
            FieldType::UInt64 => "uint64",
            FieldType::Int64 => "int64",
            FieldType::Double => "double",
            FieldType::String => "string",
        };
        f.write_str(name)
    }
}

/// A single field declaration in a [`MessageSchema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub id: u32,
    pub name: String,
    pub field_type: FieldType,
    /// May appear any number of times (including zero).
    pub repeated: bool,
    /// May be absent. Ignored for repeated fields, which are always optional.
    pub optional: bool,
}

impl Field {
    /// Returns `true` if a message is valid without this field.
    pub fn is_required(&self) -> bool {
        !self.repeated && !self.optional
    }
}

/// Ordered list of fields describing the payload of one table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageSchema {
    name: String,
    fields: Vec<Field>,
}

impl MessageSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a field declaration. Field ids must be unique within a schema.
    pub fn add_field(
        &mut self,
        id: u32,
        name: impl Into<String>,
        field_type: FieldType,
        repeated: bool,
        optional: bool,
    ) -> &mut Self {
        self.fields.push(Field {
            id,
            name: name.into(),
            field_type,
            repeated,
            optional,
        });
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_by_id(&self, id: u32) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    UInt64(u64),
    Int64(i64),
    Double(f64),
    String(Vec<u8>),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Bool(_) => FieldType::Bool,
            Value::UInt64(_) => FieldType::UInt64,
            Value::Int64(_) => FieldType::Int64,
            Value::Double(_) => FieldType::Double,
            Value::String(_) => FieldType::String,
        }
    }
}

/// A structured row: `(field_id, value)` pairs in encounter order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageObject {
    fields: Vec<(u32, Value)>,
}

impl MessageObject {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn push(&mut self, id: u32, value: Value) {
        self.fields.push((id, value));
    }

    pub fn fields(&self) -> &[(u32, Value)] {
        &self.fields
    }

    /// First value for `id`, if any.
    pub fn get(&self, id: u32) -> Option<&Value> {
        self.values(id).next()
    }

    /// All values for `id` in encounter order.
    pub fn values(&self, id: u32) -> impl Iterator<Item = &Value> {
        self.fields
            .iter()
            .filter(move |(fid, _)| *fid == id)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Errors that can occur while encoding or decoding a message.
#[derive(Debug, Error)]
pub enum MsgError {
    /// An underlying I/O error (truncated payload surfaces as `UnexpectedEof`).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown field id {0}")]
    UnknownField(u32),

    #[error("type mismatch for field '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: FieldType,
    },

    #[error("unknown type tag {0}")]
    UnknownType(u8),

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("non-repeated field '{0}' appears more than once")]
    DuplicateField(String),

    #[error("string field too large: {0} bytes")]
    TooLarge(usize),
}

/// Serializes `obj` against `schema`.
///
/// Every field id must be declared in the schema with a matching type, and
/// every required field must be present.
pub fn encode(obj: &MessageObject, schema: &MessageSchema) -> Result<Vec<u8>, MsgError> {
    validate(obj, schema)?;

    let mut buf = Vec::with_capacity(64);
    for (id, value) in obj.fields() {
        buf.write_u32::<LittleEndian>(*id)?;
        buf.write_u8(value.field_type().tag())?;
        match value {
            Value::Bool(b) => buf.write_u8(u8::from(*b))?,
            Value::UInt64(v) => buf.write_u64::<LittleEndian>(*v)?,
            Value::Int64(v) => buf.write_i64::<LittleEndian>(*v)?,
            Value::Double(v) => buf.write_f64::<LittleEndian>(*v)?,
            Value::String(s) => {
                if s.len() > MAX_STRING_BYTES {
                    return Err(MsgError::TooLarge(s.len()));
                }
                buf.write_u32::<LittleEndian>(s.len() as u32)?;
                buf.extend_from_slice(s);
            }
        }
    }

    Ok(buf)
}

/// Parses `data` into a [`MessageObject`] against `schema`.
///
/// # Errors
///
/// - [`MsgError::UnknownField`] for ids not declared in the schema.
/// - [`MsgError::TypeMismatch`] if the wire tag disagrees with the schema.
/// - [`MsgError::Io`] (`UnexpectedEof`) on a truncated payload.
/// - [`MsgError::MissingField`] / [`MsgError::DuplicateField`] on shape errors.
pub fn decode(mut data: &[u8], schema: &MessageSchema) -> Result<MessageObject, MsgError> {
    let mut obj = MessageObject::new();

    while !data.is_empty() {
        let id = data.read_u32::<LittleEndian>()?;
        let tag = data.read_u8()?;

        let field = schema.field_by_id(id).ok_or(MsgError::UnknownField(id))?;
        let found = FieldType::from_tag(tag).ok_or(MsgError::UnknownType(tag))?;
        if found != field.field_type {
            return Err(MsgError::TypeMismatch {
                field: field.name.clone(),
                expected: field.field_type,
                found,
            });
        }

        let value = match found {
            FieldType::Bool => Value::Bool(data.read_u8()? != 0),
            FieldType::UInt64 => Value::UInt64(data.read_u64::<LittleEndian>()?),
            FieldType::Int64 => Value::Int64(data.read_i64::<LittleEndian>()?),
            FieldType::Double => Value::Double(data.read_f64::<LittleEndian>()?),
            FieldType::String => {
                let len = data.read_u32::<LittleEndian>()? as usize;
                if len > MAX_STRING_BYTES {
                    return Err(MsgError::TooLarge(len));
                }
                if len > data.len() {
                    return Err(MsgError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
                }
                let (bytes, rest) = data.split_at(len);
                data = rest;
                Value::String(bytes.to_vec())
            }
        };

        obj.push(id, value);
    }

    validate(&obj, schema)?;
    Ok(obj)
}

/// Checks field ids, types and cardinalities of `obj` against `schema`.
fn validate(obj: &MessageObject, schema: &MessageSchema) -> Result<(), MsgError> {
    for (id, value) in obj.fields() {
        let field = schema.field_by_id(*id).ok_or(MsgError::UnknownField(*id))?;
        if value.field_type() != field.field_type {
            return Err(MsgError::TypeMismatch {
                field: field.name.clone(),
                expected: field.field_type,
                found: value.field_type(),
            });
        }
    }

    for field in schema.fields() {
        let count = obj.values(field.id).count();
        if count == 0 && field.is_required() {
            return Err(MsgError::MissingField(field.name.clone()));
        }
        if count > 1 && !field.repeated {
            return Err(MsgError::DuplicateField(field.name.clone()));
        }
    }

    Ok(())
}
