use serde::{Deserialize, Serialize};
use tokio_postgres::types::Type;

use crate::error::{Error, Result};

/// Column types the generators know how to produce and predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlType {
    Int4,
    Int8,
    Float4,
    Float8,
    Bytea,
    Text,
    Name,
}

impl SqlType {
    /// Types the randomized generator draws from.
    pub const FUZZABLE: [SqlType; 6] = [
        SqlType::Int4,
        SqlType::Int8,
        SqlType::Float4,
        SqlType::Float8,
        SqlType::Bytea,
        SqlType::Text,
    ];

    pub fn oid(&self) -> u32 {
        match self {
            SqlType::Int4 => 23,
            SqlType::Int8 => 20,
            SqlType::Float4 => 700,
            SqlType::Float8 => 701,
            SqlType::Bytea => 17,
            SqlType::Text => 25,
            SqlType::Name => 19,
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            SqlType::Int4 => "int4",
            SqlType::Int8 => "int8",
            SqlType::Float4 => "float4",
            SqlType::Float8 => "float8",
            SqlType::Bytea => "bytea",
            SqlType::Text => "text",
            SqlType::Name => "name",
        }
    }

    pub fn pg_type(&self) -> Type {
        match self {
            SqlType::Int4 => Type::INT4,
            SqlType::Int8 => Type::INT8,
            SqlType::Float4 => Type::FLOAT4,
            SqlType::Float8 => Type::FLOAT8,
            SqlType::Bytea => Type::BYTEA,
            SqlType::Text => Type::TEXT,
            SqlType::Name => Type::NAME,
        }
    }

    /// Binary send function, used to match stored values byte for byte.
    pub fn send_function(&self) -> &'static str {
        match self {
            SqlType::Int4 => "int4send",
            SqlType::Int8 => "int8send",
            SqlType::Float4 => "float4send",
            SqlType::Float8 => "float8send",
            SqlType::Bytea => "byteasend",
            SqlType::Text => "textsend",
            SqlType::Name => "namesend",
        }
    }
}

/// One value bound to an insert, update or delete.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SqlValue {
    pub is_null: bool,
    /// Whether `datum` is sent as a binary parameter.
    pub is_binary: bool,
    pub datum: Vec<u8>,
    /// Server text output of the value, when it is not derivable from the
    /// datum alone.
    pub text_representation: Option<String>,
}

impl SqlValue {
    pub fn null() -> Self {
        Self {
            is_null: true,
            ..Default::default()
        }
    }

    pub fn int4(value: i32) -> Self {
        Self::binary(value.to_be_bytes().to_vec(), Some(value.to_string()))
    }

    pub fn int8(value: i64) -> Self {
        Self::binary(value.to_be_bytes().to_vec(), Some(value.to_string()))
    }

    pub fn float4_bits(bits: u32) -> Self {
        Self::binary(bits.to_be_bytes().to_vec(), None)
    }

    pub fn float8_bits(bits: u64) -> Self {
        Self::binary(bits.to_be_bytes().to_vec(), None)
    }

    pub fn bytes(datum: Vec<u8>) -> Self {
        Self::binary(datum, None)
    }

    pub fn text(value: String) -> Self {
        Self::binary(value.into_bytes(), None)
    }

    fn binary(datum: Vec<u8>, text_representation: Option<String>) -> Self {
        Self {
            is_null: false,
            is_binary: true,
            datum,
            text_representation,
        }
    }

    /// Bytes the server's text output function produces for this value.
    pub fn text_output(&self, ty: SqlType) -> Result<Vec<u8>> {
        if let Some(text) = &self.text_representation {
            return Ok(text.as_bytes().to_vec());
        }

        match ty {
            SqlType::Int4 => {
                let raw: [u8; 4] = self.datum.as_slice().try_into().map_err(|_| {
                    datum_width_error(ty, self.datum.len())
                })?;
                Ok(i32::from_be_bytes(raw).to_string().into_bytes())
            }
            SqlType::Int8 => {
                let raw: [u8; 8] = self.datum.as_slice().try_into().map_err(|_| {
                    datum_width_error(ty, self.datum.len())
                })?;
                Ok(i64::from_be_bytes(raw).to_string().into_bytes())
            }
            SqlType::Bytea => Ok(bytea_hex_output(&self.datum)),
            SqlType::Text | SqlType::Name => Ok(self.datum.clone()),
            SqlType::Float4 | SqlType::Float8 => Err(Error::Expectation {
                message: format!(
                    "{} values have no canonical text output; keep oid {} in binary_oid_ranges",
                    ty.sql_name(),
                    ty.oid()
                ),
            }),
        }
    }

    /// Short human-readable rendering for transaction descriptions.
    pub fn describe(&self) -> String {
        const SHOWN: usize = 16;

        if self.is_null {
            return "NULL".to_string();
        }
        if let Some(text) = &self.text_representation {
            return text.clone();
        }
        let mut out = format!("[{} bytes] ", self.datum.len());
        for byte in self.datum.iter().take(SHOWN) {
            out.push_str(&format!("{:02x}", byte));
        }
        if self.datum.len() > SHOWN {
            out.push_str("...");
        }
        out
    }
}

fn datum_width_error(ty: SqlType, len: usize) -> Error {
    Error::Expectation {
        message: format!("{} datum has {} bytes", ty.sql_name(), len),
    }
}

/// `byteaout` in hex mode: `\x` followed by lowercase hex digits.
pub fn bytea_hex_output(datum: &[u8]) -> Vec<u8> {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let mut out = Vec::with_capacity(2 + datum.len() * 2);
    out.extend_from_slice(b"\\x");
    for byte in datum {
        out.push(HEX[(byte >> 4) as usize]);
        out.push(HEX[(byte & 0x0F) as usize]);
    }
    out
}

/// Quote an identifier the way `quote_ident` does for mixed-case names.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A generated table, created for one test run and dropped afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSchema {
    pub table_name: String,
    pub column_names: Vec<String>,
    pub column_types: Vec<SqlType>,
}

impl TestSchema {
    pub fn num_columns(&self) -> usize {
        self.column_names.len()
    }

    /// DDL that (re)creates the table. Replica identity is FULL so that
    /// updates and deletes carry the whole old row.
    pub fn setup_sql(&self) -> String {
        let table = quote_ident(&self.table_name);
        let columns: Vec<String> = self
            .column_names
            .iter()
            .zip(&self.column_types)
            .map(|(name, ty)| format!("    {} {}", quote_ident(name), ty.sql_name()))
            .collect();

        format!(
            "DROP TABLE IF EXISTS {table};\n\nCREATE TABLE {table} (\n{}\n);\n\nALTER TABLE {table} REPLICA IDENTITY FULL;",
            columns.join(",\n")
        )
    }

    pub fn teardown_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {};", quote_ident(&self.table_name))
    }

    /// `table (col type, ...)` for progress logging.
    pub fn describe(&self) -> String {
        let columns: Vec<String> = self
            .column_names
            .iter()
            .zip(&self.column_types)
            .map(|(name, ty)| format!("{} {}", name, ty.sql_name()))
            .collect();
        format!("{} ({})", self.table_name, columns.join(", "))
    }
}
