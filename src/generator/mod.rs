//! Schema and transaction generators.
//!
//! A [`SchemaGenerator`] produces tables; for each table a
//! [`TransactionGenerator`] produces the transactions to run against it.
//! All randomness comes from an injected [`rand::rngs::StdRng`], so a seed
//! replays a run exactly.

pub mod exhaustive;
pub mod fuzzy;

use crate::postgres::types::{SqlValue, TestSchema};

pub use exhaustive::{ExhaustiveSchemaGenerator, ExhaustiveTransactionGenerator};
pub use fuzzy::{FuzzySchemaGenerator, FuzzyTransactionGenerator};

/// Longest identifier PostgreSQL keeps without truncation.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

pub trait SchemaGenerator {
    /// Next table to test, or `None` once the generator is exhausted.
    fn generate_schema(&mut self) -> Option<TestSchema>;
}

pub trait TransactionGenerator {
    /// Next transaction for the current table, or `None` when done.
    fn generate_transaction(&mut self) -> Option<Transaction>;
}

/// One row-level statement. Values are in column order.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert { values: Vec<SqlValue> },
    /// Replace the row equal to `old` with `new`.
    Update {
        old: Vec<SqlValue>,
        new: Vec<SqlValue>,
    },
    /// Remove the row equal to `old`.
    Delete { old: Vec<SqlValue> },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "Insert",
            Operation::Update { .. } => "Update",
            Operation::Delete { .. } => "Delete",
        }
    }

    pub fn describe(&self, schema: &TestSchema) -> String {
        match self {
            Operation::Insert { values } => {
                format!("Insert {} {}", schema.table_name, describe_row(values))
            }
            Operation::Update { old, new } => format!(
                "Update {} {} -> {}",
                schema.table_name,
                describe_row(old),
                describe_row(new)
            ),
            Operation::Delete { old } => {
                format!("Delete {} {}", schema.table_name, describe_row(old))
            }
        }
    }
}

fn describe_row(values: &[SqlValue]) -> String {
    if values.is_empty() {
        return "{}".to_string();
    }
    let rendered: Vec<String> = values
        .iter()
        .map(|v| format!("    {}", v.describe()))
        .collect();
    format!("{{\n{}\n}}", rendered.join(",\n"))
}

/// Operations executed inside one database transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transaction {
    pub operations: Vec<Operation>,
}

impl Transaction {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    pub fn describe(&self, schema: &TestSchema) -> String {
        self.operations
            .iter()
            .map(|op| op.describe(schema))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
