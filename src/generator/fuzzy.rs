//! Randomized schemas and transactions.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{Operation, SchemaGenerator, Transaction, TransactionGenerator, MAX_IDENTIFIER_LENGTH};
use crate::postgres::types::{SqlType, SqlValue, TestSchema};

const IDENTIFIER_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyz_ABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890";
const TEXT_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Exclusive upper bound on the number of columns.
const MAX_COLUMNS: i64 = 512;
const NULL_PROBABILITY: f64 = 0.05;
/// Rows larger than this run into server limits; generation restarts.
const ROW_SIZE_BUDGET: usize = 128 * 1024 * 1024;
const MIN_VARLENA_BUDGET: usize = 64;
const MAX_VARLENA_LENGTH: usize = 64 * 1024 * 1024;
const BYTEA_FILL_BYTE: u8 = 0xBB;
const BASE_TRANSACTIONS: f64 = 65536.0;
const TRANSACTION_SPREAD: f64 = 16384.0;
/// Rows remembered as update/delete targets per table.
const MAX_TRACKED_ROWS: usize = 256;

/// Standard normal draw (Box-Muller).
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// `N(mean, std_dev)` truncated toward zero.
fn normal_int<R: Rng + ?Sized>(rng: &mut R, mean: f64, std_dev: f64) -> i64 {
    (standard_normal(rng) * std_dev + mean) as i64
}

pub struct FuzzySchemaGenerator {
    rng: StdRng,
}

impl FuzzySchemaGenerator {
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }

    pub fn from_seed(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    /// A transaction generator for `schema`, seeded from this generator.
    pub fn transaction_generator(
        &mut self,
        schema: &TestSchema,
        settings: FuzzySettings,
    ) -> FuzzyTransactionGenerator {
        let rng = StdRng::seed_from_u64(self.rng.gen());
        FuzzyTransactionGenerator::new(schema.clone(), rng, settings)
    }

    /// Advance past `n` schemas and their transaction generators, leaving
    /// this generator where a run would be at table `n`.
    pub fn skip(&mut self, n: usize) {
        for _ in 0..n {
            if self.generate_schema().is_none() {
                break;
            }
            // seed its transaction generator would have taken
            let _: u64 = self.rng.gen();
        }
    }

    fn identifier(&mut self) -> String {
        let length = loop {
            let n = normal_int(&mut self.rng, 5.0, 10.0);
            if n > 0 && n as usize <= MAX_IDENTIFIER_LENGTH {
                break n as usize;
            }
        };
        (0..length)
            .map(|_| IDENTIFIER_ALPHABET[self.rng.gen_range(0..IDENTIFIER_ALPHABET.len())] as char)
            .collect()
    }
}

impl SchemaGenerator for FuzzySchemaGenerator {
    fn generate_schema(&mut self) -> Option<TestSchema> {
        let num_columns = loop {
            let n = normal_int(&mut self.rng, 5.0, 10.0);
            if n > 0 && n < MAX_COLUMNS {
                break n as usize;
            }
        };

        let table_name = self.identifier();
        let mut column_names: Vec<String> = Vec::with_capacity(num_columns);
        let mut column_types = Vec::with_capacity(num_columns);
        while column_names.len() < num_columns {
            let name = self.identifier();
            if column_names.contains(&name) {
                continue;
            }
            column_names.push(name);
            column_types.push(SqlType::FUZZABLE[self.rng.gen_range(0..SqlType::FUZZABLE.len())]);
        }

        Some(TestSchema {
            table_name,
            column_names,
            column_types,
        })
    }
}

/// Knobs of a [`FuzzyTransactionGenerator`].
#[derive(Debug, Clone, Copy)]
pub struct FuzzySettings {
    /// Cap on the number of transactions, on top of the random count.
    pub max_transactions: Option<usize>,
    pub update_probability: f64,
    pub delete_probability: f64,
}

impl Default for FuzzySettings {
    fn default() -> Self {
        Self {
            max_transactions: None,
            update_probability: 0.1,
            delete_probability: 0.1,
        }
    }
}

pub struct FuzzyTransactionGenerator {
    schema: TestSchema,
    rng: StdRng,
    settings: FuzzySettings,
    max_transactions: usize,
    num_transactions: usize,
    live_rows: Vec<Vec<SqlValue>>,
}

impl FuzzyTransactionGenerator {
    pub fn new(schema: TestSchema, mut rng: StdRng, settings: FuzzySettings) -> Self {
        let random_max =
            (BASE_TRANSACTIONS + standard_normal(&mut rng).abs() * TRANSACTION_SPREAD) as usize;
        let max_transactions = match settings.max_transactions {
            Some(cap) => random_max.min(cap),
            None => random_max,
        };

        Self {
            schema,
            rng,
            settings,
            max_transactions,
            num_transactions: 0,
            live_rows: Vec::new(),
        }
    }

    pub fn max_transactions(&self) -> usize {
        self.max_transactions
    }

    fn value(&mut self, ty: SqlType, budget: usize) -> SqlValue {
        if self.rng.gen::<f64>() < NULL_PROBABILITY {
            return SqlValue::null();
        }

        match ty {
            SqlType::Int4 => SqlValue::int4(self.rng.gen::<u32>() as i32),
            SqlType::Int8 => SqlValue::int8(self.rng.gen::<u64>() as i64),
            SqlType::Float4 => SqlValue::float4_bits(self.rng.gen()),
            SqlType::Float8 => SqlValue::float8_bits(self.rng.gen()),
            SqlType::Bytea => {
                let len = self.varlena_length(budget);
                SqlValue::bytes(vec![BYTEA_FILL_BYTE; len])
            }
            SqlType::Text | SqlType::Name => {
                let len = self.varlena_length(budget);
                let text: String = (0..len)
                    .map(|_| TEXT_ALPHABET[self.rng.gen_range(0..TEXT_ALPHABET.len())] as char)
                    .collect();
                SqlValue::text(text)
            }
        }
    }

    fn varlena_length(&mut self, budget: usize) -> usize {
        if budget < MIN_VARLENA_BUDGET {
            return 0;
        }
        loop {
            let len = (standard_normal(&mut self.rng).abs() * 200.0 + 300.0) as usize;
            if len < MAX_VARLENA_LENGTH {
                return len;
            }
        }
    }

    /// A full row within [`ROW_SIZE_BUDGET`].
    fn row(&mut self) -> Vec<SqlValue> {
        let types = self.schema.column_types.clone();
        'restart: loop {
            let mut used = 0usize;
            let mut values = Vec::with_capacity(types.len());
            for (column, &ty) in types.iter().enumerate() {
                let value = self.value(ty, ROW_SIZE_BUDGET.saturating_sub(used));
                used += value.datum.len();
                if used >= ROW_SIZE_BUDGET {
                    debug!(
                        used,
                        budget = ROW_SIZE_BUDGET,
                        column,
                        "Row size budget exceeded, regenerating row"
                    );
                    continue 'restart;
                }
                values.push(value);
            }
            return values;
        }
    }

    fn track(&mut self, row: Vec<SqlValue>) {
        if self.live_rows.len() < MAX_TRACKED_ROWS {
            self.live_rows.push(row);
        } else {
            let idx = self.rng.gen_range(0..self.live_rows.len());
            self.live_rows[idx] = row;
        }
    }

    fn operation(&mut self) -> Operation {
        let can_modify = self.schema.num_columns() > 0 && !self.live_rows.is_empty();
        let roll: f64 = self.rng.gen();

        if can_modify && roll < self.settings.update_probability {
            let idx = self.rng.gen_range(0..self.live_rows.len());
            let new = self.row();
            let old = std::mem::replace(&mut self.live_rows[idx], new.clone());
            Operation::Update { old, new }
        } else if can_modify
            && roll < self.settings.update_probability + self.settings.delete_probability
        {
            let idx = self.rng.gen_range(0..self.live_rows.len());
            let old = self.live_rows.swap_remove(idx);
            Operation::Delete { old }
        } else {
            let values = self.row();
            self.track(values.clone());
            Operation::Insert { values }
        }
    }
}

impl TransactionGenerator for FuzzyTransactionGenerator {
    fn generate_transaction(&mut self) -> Option<Transaction> {
        if self.num_transactions >= self.max_transactions {
            return None;
        }

        let num_operations = loop {
            let n = normal_int(&mut self.rng, 5.0, 10.0);
            if n >= 1 {
                break n as usize;
            }
        };

        let operations = (0..num_operations).map(|_| self.operation()).collect();
        self.num_transactions += 1;

        Some(Transaction::new(operations))
    }
}
