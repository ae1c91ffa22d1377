//! Protobuf entities carried by the pg_pb3_ld wire format.
//!
//! Field numbers follow the output plugin's `.proto` definitions.

use std::fmt;

/// Longest value prefix rendered by the [`fmt::Display`] implementations.
const DISPLAY_VALUE_BYTES: usize = 32;

/// Type tag of one sub-message in a wire message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Begin = 0,
    Commit = 1,
    Insert = 2,
    Update = 3,
    Delete = 4,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Begin => "BeginTransaction",
            MessageType::Commit => "CommitTransaction",
            MessageType::Insert => "InsertDescription",
            MessageType::Update => "UpdateDescription",
            MessageType::Delete => "DeleteDescription",
        }
    }
}

/// Parallel type/offset table in front of the payload blob.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireMessageHeader {
    #[prost(enumeration = "MessageType", repeated, tag = "1")]
    pub types: Vec<i32>,
    #[prost(uint32, repeated, tag = "2")]
    pub offsets: Vec<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BeginTransaction {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CommitTransaction {}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct TableDescription {
    #[prost(string, tag = "1")]
    pub schema_name: String,
    #[prost(string, tag = "2")]
    pub table_name: String,
    /// Zero unless `enable_table_oids` is on.
    #[prost(uint32, tag = "3")]
    pub table_oid: u32,
}

/// Column names, values and per-column metadata of one row image.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct FieldSetDescription {
    #[prost(string, repeated, tag = "2")]
    pub names: Vec<String>,
    /// Empty for null fields.
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub values: Vec<Vec<u8>>,
    #[prost(uint32, repeated, packed = "false", tag = "4")]
    pub type_oids: Vec<u32>,
    /// One byte per field: 1 for null, 0 otherwise.
    #[prost(bytes = "vec", tag = "5")]
    pub nulls: Vec<u8>,
    /// One byte per reported field: 1 for binary, 0 for text.
    #[prost(bytes = "vec", tag = "6")]
    pub formats: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct InsertDescription {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableDescription>,
    #[prost(message, optional, tag = "3")]
    pub new_values: Option<FieldSetDescription>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct UpdateDescription {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableDescription>,
    #[prost(message, optional, tag = "3")]
    pub key_fields: Option<FieldSetDescription>,
    #[prost(message, optional, tag = "5")]
    pub new_values: Option<FieldSetDescription>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct DeleteDescription {
    #[prost(message, optional, tag = "1")]
    pub table: Option<TableDescription>,
    #[prost(message, optional, tag = "3")]
    pub key_fields: Option<FieldSetDescription>,
}

/// One decoded sub-message of a wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Begin(BeginTransaction),
    Commit(CommitTransaction),
    Insert(InsertDescription),
    Update(UpdateDescription),
    Delete(DeleteDescription),
}

impl WireMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            WireMessage::Begin(_) => MessageType::Begin,
            WireMessage::Commit(_) => MessageType::Commit,
            WireMessage::Insert(_) => MessageType::Insert,
            WireMessage::Update(_) => MessageType::Update,
            WireMessage::Delete(_) => MessageType::Delete,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        use prost::Message;

        match self {
            WireMessage::Begin(m) => m.encode_to_vec(),
            WireMessage::Commit(m) => m.encode_to_vec(),
            WireMessage::Insert(m) => m.encode_to_vec(),
            WireMessage::Update(m) => m.encode_to_vec(),
            WireMessage::Delete(m) => m.encode_to_vec(),
        }
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message_type().as_str())?;
        match self {
            WireMessage::Begin(_) | WireMessage::Commit(_) => Ok(()),
            WireMessage::Insert(m) => {
                write_table(f, m.table.as_ref())?;
                write_fields(f, "new_values", m.new_values.as_ref())
            }
            WireMessage::Update(m) => {
                write_table(f, m.table.as_ref())?;
                write_fields(f, "new_values", m.new_values.as_ref())?;
                write_fields(f, "key_fields", m.key_fields.as_ref())
            }
            WireMessage::Delete(m) => {
                write_table(f, m.table.as_ref())?;
                write_fields(f, "key_fields", m.key_fields.as_ref())
            }
        }
    }
}

fn write_table(f: &mut fmt::Formatter<'_>, table: Option<&TableDescription>) -> fmt::Result {
    match table {
        Some(t) => write!(
            f,
            "\n  table: {}.{} oid={}",
            t.schema_name, t.table_name, t.table_oid
        ),
        None => write!(f, "\n  table: <none>"),
    }
}

fn write_fields(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    fields: Option<&FieldSetDescription>,
) -> fmt::Result {
    let Some(fsd) = fields else {
        return write!(f, "\n  {}: <none>", label);
    };

    write!(f, "\n  {}:", label)?;
    write!(f, "\n    names: {:?}", fsd.names)?;
    write!(f, "\n    values:")?;
    for value in &fsd.values {
        write!(f, "\n      ")?;
        write_value(f, value)?;
    }
    write!(f, "\n    type_oids: {:?}", fsd.type_oids)?;
    write!(f, "\n    nulls: {:?}", fsd.nulls)?;
    write!(f, "\n    formats: {:?}", fsd.formats)
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &[u8]) -> fmt::Result {
    write!(f, "[{} bytes] ", value.len())?;
    for byte in value.iter().take(DISPLAY_VALUE_BYTES) {
        write!(f, "{:02x}", byte)?;
    }
    if value.len() > DISPLAY_VALUE_BYTES {
        write!(f, "...")?;
    }
    Ok(())
}
