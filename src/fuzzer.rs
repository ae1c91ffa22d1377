//! The test driver: creates tables, runs generated transactions against
//! them and compares what the output plugin emits with what
//! [`ExpectationBuilder`] predicts.

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::expect::{ExpectationBuilder, SCHEMA_NAME};
use crate::generator::fuzzy::FuzzySettings;
use crate::generator::{
    ExhaustiveSchemaGenerator, ExhaustiveTransactionGenerator, FuzzySchemaGenerator,
    SchemaGenerator, Transaction, TransactionGenerator,
};
use crate::options::PluginOptions;
use crate::postgres::statement::OperationStatement;
use crate::postgres::types::{quote_ident, TestSchema};
use crate::report::{FailureReport, FileReportSink, Phase, ReportSink};
use crate::session::ReplicationSession;
use crate::wire::WireMessage;
use crate::{Error, Result};

/// A failed run, with the transaction being checked and both message
/// streams as far as they got.
#[derive(Debug, thiserror::Error)]
#[error("{cause}")]
pub struct FuzzerError {
    pub transaction: Option<Transaction>,
    pub expected: Vec<WireMessage>,
    pub received: Vec<WireMessage>,
    #[source]
    pub cause: Error,
}

impl FuzzerError {
    fn new(cause: Error) -> Self {
        Self {
            transaction: None,
            expected: Vec::new(),
            received: Vec::new(),
            cause,
        }
    }

    fn during(txn: &Transaction, cause: Error) -> Self {
        Self {
            transaction: Some(txn.clone()),
            ..Self::new(cause)
        }
    }
}

impl From<Error> for FuzzerError {
    fn from(cause: Error) -> Self {
        Self::new(cause)
    }
}

/// Result of one table's test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Passed { transactions: usize },
    Failed,
}

/// Totals over a sequence of tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub schemas: usize,
    pub transactions: usize,
    pub failures: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: TestOutcome) {
        self.schemas += 1;
        match outcome {
            TestOutcome::Passed { transactions } => self.transactions += transactions,
            TestOutcome::Failed => self.failures += 1,
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.schemas += other.schemas;
        self.transactions += other.transactions;
        self.failures += other.failures;
    }
}

pub struct Fuzzer<S: ReportSink = FileReportSink> {
    config: Config,
    options: PluginOptions,
    client: Client,
    connection_task: JoinHandle<()>,
    session: Option<ReplicationSession>,
    sink: S,
    seed: Option<u64>,
    schema_index: Option<usize>,
    last_progress: Option<Instant>,
}

impl Fuzzer<FileReportSink> {
    /// Connect with the options from `config` and reports written to its
    /// errors directory.
    pub async fn connect(config: Config) -> Result<Self> {
        let options = config.session.plugin_options()?;
        let sink = FileReportSink::new(&config.fuzzer.errors_dir);
        Self::with_sink(config, options, sink).await
    }
}

impl<S: ReportSink> Fuzzer<S> {
    pub async fn with_sink(config: Config, options: PluginOptions, sink: S) -> Result<Self> {
        options.check_fuzzable()?;

        info!(
            host = %config.postgres.host,
            port = config.postgres.port,
            database = %config.postgres.database,
            "Connecting to PostgreSQL"
        );

        let (client, connection) = config.postgres.pg_config().connect(NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        let mut fuzzer = Self {
            config,
            options,
            client,
            connection_task,
            session: None,
            sink,
            seed: None,
            schema_index: None,
            last_progress: None,
        };

        fuzzer.check_superuser().await?;
        fuzzer.create_replication_slot().await?;
        Ok(fuzzer)
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    /// Switch plugin options. The open session, if any, is closed since
    /// options only apply to new sessions.
    pub async fn set_options(&mut self, options: PluginOptions) -> Result<()> {
        options.check_fuzzable()?;
        if options != self.options {
            self.close_session().await?;
            self.options = options;
        }
        Ok(())
    }

    async fn check_superuser(&self) -> Result<()> {
        let row = self.client.query_one("SHOW is_superuser", &[]).await?;
        let is_superuser: String = row.try_get(0)?;
        if is_superuser != "on" {
            return Err(Error::Config(format!(
                "user {} is not a superuser (is_superuser = {:?})",
                self.config.postgres.username, is_superuser
            )));
        }
        Ok(())
    }

    /// Create the slot, replacing one left over from an earlier run.
    async fn create_replication_slot(&self) -> Result<()> {
        let slot = &self.config.session.slot_name;
        let plugin = &self.config.session.plugin;
        let create = "SELECT pg_create_logical_replication_slot($1, $2)";

        match self.client.execute(create, &[slot, plugin]).await {
            Ok(_) => {}
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
                info!(slot = %slot, "Replication slot already exists, recreating it");
                self.client
                    .execute("SELECT pg_drop_replication_slot($1)", &[slot])
                    .await?;
                self.client.execute(create, &[slot, plugin]).await?;
            }
            Err(e) => return Err(e.into()),
        }

        info!(slot = %slot, plugin = %plugin, "Created replication slot");
        Ok(())
    }

    async fn open_session(&mut self) -> Result<()> {
        if self.session.is_none() {
            info!(options = %self.options, "Opening replication session");
            let session = ReplicationSession::open(
                &self.config.postgres,
                &self.config.session,
                &self.options,
            )
            .await?;
            self.session = Some(session);
        }
        Ok(())
    }

    async fn close_session(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => session.shutdown().await,
            None => Ok(()),
        }
    }

    /// Shut the session down and drop the slot.
    pub async fn close(mut self) -> Result<()> {
        let result = self.close_session().await;

        let slot = &self.config.session.slot_name;
        if let Err(e) = self
            .client
            .execute("SELECT pg_drop_replication_slot($1)", &[slot])
            .await
        {
            warn!(slot = %slot, "Failed to drop replication slot: {}", e);
        }

        self.connection_task.abort();
        result
    }

    /// Fuzz randomly generated tables, forever unless `max_schemas` is set.
    pub async fn run_fuzz(&mut self, seed: u64, max_schemas: Option<usize>) -> Result<RunSummary> {
        self.run_fuzz_from(seed, 0, max_schemas).await
    }

    /// Like [`Fuzzer::run_fuzz`], but starting at table `start_at` of the
    /// run `seed` describes.
    pub async fn run_fuzz_from(
        &mut self,
        seed: u64,
        start_at: usize,
        max_schemas: Option<usize>,
    ) -> Result<RunSummary> {
        info!(seed, start_at, "Starting randomized run");
        self.seed = Some(seed);

        let mut schemas = FuzzySchemaGenerator::from_seed(seed);
        schemas.skip(start_at);
        let mut summary = RunSummary::default();
        while max_schemas.map_or(true, |max| summary.schemas < max) {
            let Some(schema) = schemas.generate_schema() else {
                break;
            };
            self.schema_index = Some(start_at + summary.schemas);
            let generator = schemas.transaction_generator(&schema, self.fuzzy_settings());
            let outcome = self.test_main(&schema, generator).await?;
            summary.record(outcome);
        }

        info!(?summary, "Randomized run finished");
        Ok(summary)
    }

    /// Walk every exhaustive table and every value combination.
    pub async fn run_exhaustive(&mut self) -> Result<RunSummary> {
        let extended = self.config.fuzzer.extended_boundaries;
        info!(extended, "Starting exhaustive run");
        self.seed = None;

        let mut schemas = ExhaustiveSchemaGenerator::new();
        let mut summary = RunSummary::default();
        while let Some(schema) = schemas.generate_schema() {
            self.schema_index = Some(summary.schemas);
            let generator = ExhaustiveTransactionGenerator::new(&schema, extended);
            debug!(
                table = %schema.table_name,
                transactions = generator.total(),
                "Exhaustive table"
            );
            let outcome = self.test_main(&schema, generator).await?;
            summary.record(outcome);
        }

        info!(?summary, "Exhaustive run finished");
        Ok(summary)
    }

    /// `schemas_per_combination` randomized tables for every option
    /// combination of [`PluginOptions::matrix`].
    pub async fn run_matrix(
        &mut self,
        seed: u64,
        schemas_per_combination: usize,
    ) -> Result<RunSummary> {
        let combinations = PluginOptions::matrix()?;
        info!(
            seed,
            combinations = combinations.len(),
            schemas_per_combination,
            "Starting option matrix run"
        );

        let mut summary = RunSummary::default();
        for (idx, options) in combinations.into_iter().enumerate() {
            info!(combination = idx + 1, options = %options, "Testing option combination");
            self.set_options(options).await?;
            let combination_seed = seed.wrapping_add(idx as u64);
            summary.merge(
                self.run_fuzz(combination_seed, Some(schemas_per_combination))
                    .await?,
            );
        }

        info!(?summary, "Option matrix run finished");
        Ok(summary)
    }

    fn fuzzy_settings(&self) -> FuzzySettings {
        FuzzySettings {
            max_transactions: self.config.fuzzer.max_transactions_per_schema,
            update_probability: self.config.fuzzer.update_probability,
            delete_probability: self.config.fuzzer.delete_probability,
        }
    }

    /// Create `schema`, run `generator` against it and drop it again.
    ///
    /// A failed setup or run is reported and returned as
    /// [`TestOutcome::Failed`] after closing the session and pausing; only
    /// errors that must stop the process are returned as `Err`.
    pub async fn test_main<G: TransactionGenerator>(
        &mut self,
        schema: &TestSchema,
        generator: G,
    ) -> Result<TestOutcome> {
        let outcome = match self.setup(schema).await {
            Err(e) => {
                self.report(FailureReport::new(Phase::Setup, &e, schema, &self.options))
                    .await;
                Err(FuzzerError::new(e))
            }
            Ok(table_oid) => {
                let result = self.run_tests(schema, generator, table_oid).await;
                if let Err(e) = &result {
                    self.report(FailureReport::from_fuzzer_error(e, schema, &self.options))
                        .await;
                }
                result
            }
        };
        self.teardown(schema).await;

        match outcome {
            Ok(transactions) => Ok(TestOutcome::Passed { transactions }),
            Err(e) if e.cause.is_fatal() => {
                error!("Fatal failure on table {}: {}", schema.table_name, e);
                Err(e.cause)
            }
            Err(e) => {
                error!("Test failure on table {}: {}", schema.table_name, e);
                if let Err(close_err) = self.close_session().await {
                    if close_err.is_fatal() {
                        return Err(close_err);
                    }
                    warn!("Replication session ended with: {}", close_err);
                }
                tokio::time::sleep(self.config.fuzzer.failure_pause()).await;
                Ok(TestOutcome::Failed)
            }
        }
    }

    /// Create the table and return its OID.
    async fn setup(&mut self, schema: &TestSchema) -> Result<u32> {
        self.client.batch_execute(&schema.setup_sql()).await?;

        let qualified = format!("{}.{}", SCHEMA_NAME, quote_ident(&schema.table_name));
        let row = self
            .client
            .query_one("SELECT $1::text::regclass::oid", &[&qualified])
            .await?;
        let table_oid: u32 = row.try_get(0)?;

        self.open_session().await?;
        Ok(table_oid)
    }

    async fn teardown(&self, schema: &TestSchema) {
        if let Err(e) = self.client.batch_execute(&schema.teardown_sql()).await {
            warn!(table = %schema.table_name, "Failed to drop test table: {}", e);
        }
    }

    async fn report(&self, report: FailureReport) {
        let report = report.with_origin(self.seed, self.schema_index);
        if let Err(e) = self.sink.write_report(&report).await {
            error!("Failed to write failure report: {}", e);
        }
    }

    async fn run_tests<G: TransactionGenerator>(
        &mut self,
        schema: &TestSchema,
        mut generator: G,
        table_oid: u32,
    ) -> std::result::Result<usize, FuzzerError> {
        let watermark: PgLsn = self
            .client
            .query_one("SELECT pg_current_wal_lsn()", &[])
            .await
            .map_err(Error::from)?
            .try_get(0)
            .map_err(Error::from)?;
        let watermark = u64::from(watermark);
        trace!(watermark = %PgLsn::from(watermark), "Captured WAL watermark");

        let options = self.options.clone();
        let builder = ExpectationBuilder::new(schema, &options, table_oid);
        let mut transactions = 0usize;

        while let Some(txn) = generator.generate_transaction() {
            self.log_progress(schema);

            let expected = builder
                .transaction(&txn)
                .map_err(|e| FuzzerError::during(&txn, e))?;
            self.execute(schema, &txn)
                .await
                .map_err(|e| FuzzerError::during(&txn, e))?;
            self.compare(&txn, expected, watermark).await?;
            transactions += 1;
        }

        debug!(table = %schema.table_name, transactions, "Table passed");
        Ok(transactions)
    }

    /// Run every operation of `txn` in one database transaction.
    async fn execute(&mut self, schema: &TestSchema, txn: &Transaction) -> Result<()> {
        let db_txn = self.client.transaction().await?;
        for op in &txn.operations {
            let stmt = OperationStatement::new(schema, op);
            let prepared = db_txn.prepare_typed(&stmt.sql, &stmt.types).await?;
            let affected = db_txn.execute(&prepared, &stmt.param_refs()).await?;
            if affected != 1 {
                return Err(Error::Expectation {
                    message: format!(
                        "{} on {} affected {} rows",
                        op.kind(),
                        schema.table_name,
                        affected
                    ),
                });
            }
        }
        db_txn.commit().await?;
        Ok(())
    }

    /// Pull one message per expected message. Messages from before
    /// `watermark` belong to earlier tables and are skipped.
    async fn compare(
        &mut self,
        txn: &Transaction,
        expected: Vec<WireMessage>,
        watermark: u64,
    ) -> std::result::Result<(), FuzzerError> {
        let timeout = self.config.session.receive_timeout();
        let mut received = Vec::with_capacity(expected.len());

        let failure = 'compare: {
            let Some(session) = self.session.as_mut() else {
                break 'compare Error::Replication {
                    message: "No replication session".to_string(),
                };
            };

            for want in &expected {
                let message = loop {
                    let message = match session.recv(timeout).await {
                        Ok(message) => message,
                        Err(e) => break 'compare e,
                    };
                    let message = match message.result {
                        Ok(m) if message.lsn < watermark => {
                            trace!(lsn = %PgLsn::from(message.lsn), skipped = %m, "Skipping stale message");
                            continue;
                        }
                        Ok(m) => m,
                        Err(e) => break 'compare Error::Decode(e),
                    };
                    break message;
                };

                received.push(message.clone());
                if &message != want {
                    break 'compare Error::Mismatch {
                        expected: want.to_string(),
                        received: message.to_string(),
                    };
                }
            }
            return Ok(());
        };

        Err(FuzzerError {
            transaction: Some(txn.clone()),
            expected,
            received,
            cause: failure,
        })
    }

    fn log_progress(&mut self, schema: &TestSchema) {
        let interval = self.config.fuzzer.progress_interval();
        let due = self
            .last_progress
            .map_or(true, |last| last.elapsed() >= interval);
        if due {
            info!(
                table = %schema.table_name,
                columns = %schema.column_names.join(", "),
                "Working on table"
            );
            self.last_progress = Some(Instant::now());
        }
    }
}
