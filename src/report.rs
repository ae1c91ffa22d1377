//! Failure reports.
//!
//! Every failed setup or run leaves one JSON document behind describing the
//! table, the transaction, the options in effect and the message streams
//! that disagreed, so the failure can be replayed by hand.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_pb3_fuzzer::report::{FailureReport, FileReportSink, ReportSink};
//!
//! # async fn example(report: FailureReport) -> pg_pb3_fuzzer::Result<()> {
//! let sink = FileReportSink::new("errors");
//! let path = sink.write_report(&report).await?;
//! println!("Failure written to {}", path.display());
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::fuzzer::FuzzerError;
use crate::options::PluginOptions;
use crate::postgres::types::TestSchema;
use crate::Result;

/// Stage of a test a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Creating the table.
    Setup,
    /// Executing transactions and comparing messages.
    Run,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Run => "run",
        }
    }
}

/// Everything known about one failed test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub phase: Phase,
    pub error: String,
    pub schema: TestSchema,
    pub setup_sql: Option<String>,
    /// Description of the transaction being compared, if any.
    pub transaction: Option<String>,
    pub expected: Vec<String>,
    pub received: Vec<String>,
    /// Plugin options as `name 'value'` pairs.
    pub options: Vec<String>,
    /// Seed of the schema generator, for randomized runs.
    pub seed: Option<u64>,
    /// Zero-based position of the table within its run. Together with
    /// `seed` it replays the table via `fuzz --seed <seed> --start-at <n>`.
    #[serde(default)]
    pub schema_index: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

impl FailureReport {
    pub fn new(
        phase: Phase,
        error: &crate::Error,
        schema: &TestSchema,
        options: &PluginOptions,
    ) -> Self {
        Self {
            phase,
            error: error.to_string(),
            schema: schema.clone(),
            setup_sql: Some(schema.setup_sql()),
            transaction: None,
            expected: Vec::new(),
            received: Vec::new(),
            options: options.to_replication_args(),
            seed: None,
            schema_index: None,
            timestamp: Utc::now(),
        }
    }

    /// A report for a failed run, carrying the comparison context.
    pub fn from_fuzzer_error(
        err: &FuzzerError,
        schema: &TestSchema,
        options: &PluginOptions,
    ) -> Self {
        let mut report = Self::new(Phase::Run, &err.cause, schema, options);
        report.transaction = err.transaction.as_ref().map(|t| t.describe(schema));
        report.expected = err.expected.iter().map(|m| m.to_string()).collect();
        report.received = err.received.iter().map(|m| m.to_string()).collect();
        report
    }

    /// Record where in a run the table came from.
    pub fn with_origin(mut self, seed: Option<u64>, schema_index: Option<usize>) -> Self {
        self.seed = seed;
        self.schema_index = schema_index;
        self
    }

    /// `<phase><timestamp>.json`, unique to the millisecond.
    pub fn file_name(&self) -> String {
        format!(
            "{}{}.json",
            self.phase.as_str(),
            self.timestamp.format("%Y%m%d%H%M%S%.3f")
        )
    }
}

/// Destination for failure reports.
pub trait ReportSink {
    /// Persist `report`, returning where it went.
    fn write_report(&self, report: &FailureReport) -> impl Future<Output = Result<PathBuf>> + Send;
}

/// Writes each report as a pretty-printed JSON file in one directory.
pub struct FileReportSink {
    dir: PathBuf,
}

impl FileReportSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ReportSink for FileReportSink {
    /// Writes to a temporary file first and renames it into place, so a
    /// report file is never partially written.
    async fn write_report(&self, report: &FailureReport) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.dir.join(report.file_name());
        let temp_path = path.with_extension("tmp");
        debug!(path = %path.display(), "Writing failure report");

        let json = serde_json::to_string_pretty(report)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &path).await?;

        info!(path = %path.display(), phase = report.phase.as_str(), "Failure report written");
        Ok(path)
    }
}
