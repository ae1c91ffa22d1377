//! Predicts the exact wire messages the output plugin emits for an
//! operation, given the table, the values and the session options.

use crate::generator::{Operation, Transaction};
use crate::options::{FormatsMode, PluginOptions, TypeOidsMode};
use crate::postgres::types::{SqlValue, TestSchema};
use crate::wire::{
    BeginTransaction, CommitTransaction, DeleteDescription, FieldSetDescription,
    InsertDescription, TableDescription, UpdateDescription, WireMessage,
};
use crate::{Error, Result};

/// Schema name of every generated table.
pub const SCHEMA_NAME: &str = "public";

pub struct ExpectationBuilder<'a> {
    schema: &'a TestSchema,
    options: &'a PluginOptions,
    table_oid: u32,
}

impl<'a> ExpectationBuilder<'a> {
    /// `table_oid` is only reported when `enable_table_oids` is on.
    pub fn new(schema: &'a TestSchema, options: &'a PluginOptions, table_oid: u32) -> Self {
        Self {
            schema,
            options,
            table_oid,
        }
    }

    /// Every message of `txn`, including the begin/commit markers the
    /// options ask for.
    pub fn transaction(&self, txn: &Transaction) -> Result<Vec<WireMessage>> {
        let mut messages = Vec::with_capacity(txn.operations.len() + 2);
        if self.options.enable_begin_messages {
            messages.push(WireMessage::Begin(BeginTransaction {}));
        }
        for op in &txn.operations {
            messages.push(self.operation(op)?);
        }
        if self.options.enable_commit_messages {
            messages.push(WireMessage::Commit(CommitTransaction {}));
        }
        Ok(messages)
    }

    pub fn operation(&self, op: &Operation) -> Result<WireMessage> {
        let message = match op {
            Operation::Insert { values } => WireMessage::Insert(InsertDescription {
                table: Some(self.table()),
                new_values: Some(self.field_set(values)?),
            }),
            Operation::Update { old, new } => WireMessage::Update(UpdateDescription {
                table: Some(self.table()),
                key_fields: Some(self.field_set(old)?),
                new_values: Some(self.field_set(new)?),
            }),
            Operation::Delete { old } => WireMessage::Delete(DeleteDescription {
                table: Some(self.table()),
                key_fields: Some(self.field_set(old)?),
            }),
        };
        Ok(message)
    }

    pub fn table(&self) -> TableDescription {
        TableDescription {
            schema_name: SCHEMA_NAME.to_string(),
            table_name: self.schema.table_name.clone(),
            table_oid: if self.options.enable_table_oids {
                self.table_oid
            } else {
                0
            },
        }
    }

    /// The field set for one row image, values in column order.
    pub fn field_set(&self, values: &[SqlValue]) -> Result<FieldSetDescription> {
        if values.len() != self.schema.num_columns() {
            return Err(Error::Expectation {
                message: format!(
                    "{} values for {} columns of {}",
                    values.len(),
                    self.schema.num_columns(),
                    self.schema.table_name
                ),
            });
        }

        let n = values.len();
        let mut fsd = FieldSetDescription {
            names: self.schema.column_names.clone(),
            values: Vec::with_capacity(n),
            type_oids: Vec::new(),
            nulls: Vec::with_capacity(n),
            formats: Vec::new(),
        };

        for (value, ty) in values.iter().zip(&self.schema.column_types) {
            let oid = ty.oid();
            let binary = self.options.is_binary(oid);

            if value.is_null {
                fsd.values.push(Vec::new());
                fsd.nulls.push(1);
            } else if binary {
                fsd.values.push(value.datum.clone());
                fsd.nulls.push(0);
            } else {
                fsd.values.push(value.text_output(*ty)?);
                fsd.nulls.push(0);
            }

            match self.options.type_oids_mode {
                TypeOidsMode::Disabled => {}
                TypeOidsMode::OmitNulls if value.is_null => {}
                TypeOidsMode::OmitNulls | TypeOidsMode::Full => fsd.type_oids.push(oid),
            }

            let format = u8::from(binary && !value.is_null);
            match self.options.formats_mode {
                FormatsMode::Disabled => {}
                FormatsMode::OmitNulls if value.is_null => {}
                FormatsMode::OmitNulls | FormatsMode::Full | FormatsMode::Libpq => {
                    fsd.formats.push(format)
                }
            }
        }

        if self.options.formats_mode == FormatsMode::Libpq && fsd.formats.iter().all(|&f| f == 0)
        {
            fsd.formats.clear();
        }

        Ok(fsd)
    }
}
