//! SQL for generated operations, with every parameter bound as raw bytes in
//! an explicit format and type.

use bytes::BytesMut;
use std::error::Error as StdError;
use tokio_postgres::types::{to_sql_checked, Format, IsNull, ToSql, Type};

use super::types::{quote_ident, SqlType, SqlValue, TestSchema};
use crate::generator::Operation;

/// A parameter whose bytes go to the server untouched, in the format the
/// value asks for.
#[derive(Debug)]
pub struct RawParam<'a>(pub &'a SqlValue);

impl ToSql for RawParam<'_> {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        if self.0.is_null {
            return Ok(IsNull::Yes);
        }
        out.extend_from_slice(&self.0.datum);
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        if self.0.is_binary {
            Format::Binary
        } else {
            Format::Text
        }
    }

    to_sql_checked!();
}

/// One operation as a parameterized statement.
#[derive(Debug)]
pub struct OperationStatement<'a> {
    pub sql: String,
    pub types: Vec<Type>,
    pub params: Vec<RawParam<'a>>,
}

impl<'a> OperationStatement<'a> {
    pub fn new(schema: &TestSchema, op: &'a Operation) -> Self {
        let mut stmt = Self {
            sql: String::new(),
            types: Vec::new(),
            params: Vec::new(),
        };
        let table = quote_ident(&schema.table_name);

        match op {
            Operation::Insert { values } if values.is_empty() => {
                stmt.sql = format!("INSERT INTO {} DEFAULT VALUES", table);
            }
            Operation::Insert { values } => {
                let placeholders: Vec<String> = values
                    .iter()
                    .zip(&schema.column_types)
                    .map(|(value, ty)| stmt.bind(value, ty.pg_type()))
                    .collect();
                stmt.sql = format!("INSERT INTO {} VALUES ({})", table, placeholders.join(", "));
            }
            Operation::Update { old, new } => {
                let assignments: Vec<String> = new
                    .iter()
                    .zip(schema.column_names.iter().zip(&schema.column_types))
                    .map(|(value, (name, ty))| {
                        format!("{} = {}", quote_ident(name), stmt.bind(value, ty.pg_type()))
                    })
                    .collect();
                let locate = stmt.locate_row(schema, old);
                stmt.sql = format!(
                    "UPDATE {} SET {} WHERE {}",
                    table,
                    assignments.join(", "),
                    locate
                );
            }
            Operation::Delete { old } => {
                let locate = stmt.locate_row(schema, old);
                stmt.sql = format!("DELETE FROM {} WHERE {}", table, locate);
            }
        }

        stmt
    }

    /// Parameters in the form `Transaction::execute` takes them.
    pub fn param_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect()
    }

    fn bind(&mut self, value: &'a SqlValue, ty: Type) -> String {
        self.params.push(RawParam(value));
        self.types.push(ty);
        format!("${}", self.params.len())
    }

    /// Matches exactly one row whose columns equal `row`, compared on their
    /// binary send representation so that floats match bit for bit.
    fn locate_row(&mut self, schema: &TestSchema, row: &'a [SqlValue]) -> String {
        let predicates: Vec<String> = row
            .iter()
            .zip(schema.column_names.iter().zip(&schema.column_types))
            .map(|(value, (name, &ty))| {
                let column = quote_ident(name);
                if value.is_null {
                    format!("{} IS NULL", column)
                } else if ty == SqlType::Bytea {
                    format!("{} = {}", column, self.bind(value, Type::BYTEA))
                } else {
                    format!(
                        "{}({}) = {}",
                        ty.send_function(),
                        column,
                        self.bind(value, Type::BYTEA)
                    )
                }
            })
            .collect();

        let condition = if predicates.is_empty() {
            "true".to_string()
        } else {
            predicates.join(" AND ")
        };
        format!(
            "ctid = (SELECT ctid FROM {} WHERE {} LIMIT 1)",
            quote_ident(&schema.table_name),
            condition
        )
    }
}
