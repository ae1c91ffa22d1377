//! Deterministic enumeration of identifier lengths and value lengths around
//! the points where a length prefix needs one more varint byte.

use super::{Operation, SchemaGenerator, Transaction, TransactionGenerator, MAX_IDENTIFIER_LENGTH};
use crate::postgres::types::{SqlType, SqlValue, TestSchema};

const MAX_COLUMNS: usize = 2;
const TABLE_NAME_PATTERN: &str = "xhaustive";
const COLUMN_NAME_ALPHABET: &[u8] = b"abcdefg0123456789";
const FILL_BYTE: u8 = 0xDE;

/// Value lengths that straddle the 1/2, 2/3 and 3/4 byte varint widths.
const BOUNDARY_LENGTHS: &[usize] = &[
    127, 128, 129, 16383, 16384, 16385, 2097151, 2097152, 2097153,
];

/// Straddles the 4/5 byte width. Values this large only run when asked for.
const EXTENDED_BOUNDARY_LENGTHS: &[usize] = &[268435455, 268435456, 268435457];

/// Enumerates every table-name length, column count and combination of
/// column-name lengths. All columns are bytea.
#[derive(Debug, Clone)]
pub struct ExhaustiveSchemaGenerator {
    table_name_length: usize,
    num_columns: usize,
    column_name_lengths: Vec<usize>,
    done: bool,
}

impl Default for ExhaustiveSchemaGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExhaustiveSchemaGenerator {
    pub fn new() -> Self {
        Self {
            table_name_length: 1,
            num_columns: 0,
            column_name_lengths: Vec::new(),
            done: false,
        }
    }

    fn advance(&mut self) {
        // odometer over column name lengths, first column fastest
        for len in self.column_name_lengths.iter_mut() {
            *len += 1;
            if *len <= MAX_IDENTIFIER_LENGTH {
                return;
            }
            *len = 1;
        }

        self.num_columns += 1;
        if self.num_columns > MAX_COLUMNS {
            self.num_columns = 0;
            self.table_name_length += 1;
            if self.table_name_length > MAX_IDENTIFIER_LENGTH {
                self.done = true;
            }
        }
        self.column_name_lengths = vec![1; self.num_columns];
    }
}

impl SchemaGenerator for ExhaustiveSchemaGenerator {
    fn generate_schema(&mut self) -> Option<TestSchema> {
        if self.done {
            return None;
        }

        let schema = TestSchema {
            table_name: table_name(self.table_name_length),
            column_names: self
                .column_name_lengths
                .iter()
                .enumerate()
                .map(|(idx, &len)| column_name(idx, len))
                .collect(),
            column_types: vec![SqlType::Bytea; self.num_columns],
        };

        self.advance();
        Some(schema)
    }
}

fn table_name(length: usize) -> String {
    TABLE_NAME_PATTERN
        .chars()
        .cycle()
        .take(length)
        .collect()
}

fn column_name(idx: usize, length: usize) -> String {
    let c = COLUMN_NAME_ALPHABET[idx % COLUMN_NAME_ALPHABET.len()] as char;
    std::iter::repeat(c).take(length).collect()
}

/// One single-insert transaction per combination of column values.
#[derive(Debug, Clone)]
pub struct ExhaustiveTransactionGenerator {
    /// `None` is SQL NULL, `Some(n)` is `n` fill bytes.
    sequence: Vec<Option<usize>>,
    positions: Vec<usize>,
    done: bool,
}

impl ExhaustiveTransactionGenerator {
    pub fn new(schema: &TestSchema, extended: bool) -> Self {
        let mut sequence = vec![None, Some(0), Some(1), Some(2), Some(3)];
        sequence.extend(BOUNDARY_LENGTHS.iter().map(|&n| Some(n)));
        if extended {
            sequence.extend(EXTENDED_BOUNDARY_LENGTHS.iter().map(|&n| Some(n)));
        }

        Self {
            sequence,
            positions: vec![0; schema.num_columns()],
            done: false,
        }
    }

    /// Number of transactions this generator yields in total.
    pub fn total(&self) -> usize {
        self.sequence.len().pow(self.positions.len() as u32)
    }

    fn value(&self, position: usize) -> SqlValue {
        match self.sequence[position] {
            None => SqlValue::null(),
            Some(len) => SqlValue::bytes(vec![FILL_BYTE; len]),
        }
    }

    fn advance(&mut self) {
        for pos in self.positions.iter_mut() {
            *pos += 1;
            if *pos < self.sequence.len() {
                return;
            }
            *pos = 0;
        }
        self.done = true;
    }
}

impl TransactionGenerator for ExhaustiveTransactionGenerator {
    fn generate_transaction(&mut self) -> Option<Transaction> {
        if self.done {
            return None;
        }

        let values = self.positions.iter().map(|&p| self.value(p)).collect();
        self.advance();

        Some(Transaction::new(vec![Operation::Insert { values }]))
    }
}
