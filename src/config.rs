use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::options::PluginOptions;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub fuzzer: FuzzerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Replication session settings: which slot, which plugin, which options.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_slot_name")]
    pub slot_name: String,
    #[serde(default = "default_plugin")]
    pub plugin: String,
    /// Output plugin options as `name = "value"` pairs.
    #[serde(default = "default_plugin_options")]
    pub options: BTreeMap<String, String>,
    /// How long the test loop waits for each expected message.
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
    /// Silence on the replication socket longer than this is a stall.
    #[serde(default = "default_read_deadline_secs")]
    pub read_deadline_secs: u64,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FuzzerConfig {
    /// Directory failure reports are written to.
    #[serde(default = "default_errors_dir")]
    pub errors_dir: PathBuf,
    #[serde(default = "default_failure_pause_secs")]
    pub failure_pause_secs: u64,
    /// Upper bound on transactions per randomized schema.
    #[serde(default)]
    pub max_transactions_per_schema: Option<usize>,
    #[serde(default = "default_update_probability")]
    pub update_probability: f64,
    #[serde(default = "default_delete_probability")]
    pub delete_probability: f64,
    /// Include the 268435455/268435456/268435457 value lengths in
    /// exhaustive runs.
    #[serde(default)]
    pub extended_boundaries: bool,
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        Self::build(Some(path.as_ref()))
    }

    /// Defaults plus environment overrides, without a config file.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::build(None)
    }

    fn build(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("PG_PB3_FUZZER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }
}

impl PostgresConfig {
    /// Client configuration for the regular (non-replication) connection.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.username)
            .dbname(&self.database)
            .application_name("pg-pb3-fuzzer")
            .connect_timeout(self.connect_timeout());
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }

    pub fn password(&self) -> Option<&str> {
        if self.password.is_empty() {
            None
        } else {
            Some(&self.password)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl SessionConfig {
    /// The configured plugin options, rejected up front if the fuzzer could
    /// not predict their output.
    pub fn plugin_options(&self) -> crate::Result<PluginOptions> {
        let options = PluginOptions::from_pairs(self.options.iter().map(|(k, v)| (k, Some(v))))?;
        options.check_fuzzable()?;
        Ok(options)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl FuzzerConfig {
    pub fn failure_pause(&self) -> Duration {
        Duration::from_secs(self.failure_pause_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            username: default_username(),
            password: String::new(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            slot_name: default_slot_name(),
            plugin: default_plugin(),
            options: default_plugin_options(),
            receive_timeout_secs: default_receive_timeout_secs(),
            read_deadline_secs: default_read_deadline_secs(),
            status_interval_secs: default_status_interval_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            errors_dir: default_errors_dir(),
            failure_pause_secs: default_failure_pause_secs(),
            max_transactions_per_schema: None,
            update_probability: default_update_probability(),
            delete_probability: default_delete_probability(),
            extended_boundaries: false,
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_username() -> String {
    "postgres".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_slot_name() -> String {
    "pgpb3ldtest".to_string()
}

fn default_plugin() -> String {
    "pg_pb3_ld".to_string()
}

fn default_plugin_options() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("type_oids_mode".to_string(), "omit_nulls".to_string()),
        ("formats_mode".to_string(), "disabled".to_string()),
        ("binary_oid_ranges".to_string(), "1-200000".to_string()),
    ])
}

fn default_receive_timeout_secs() -> u64 {
    15
}

fn default_read_deadline_secs() -> u64 {
    300
}

fn default_status_interval_secs() -> u64 {
    10
}

fn default_shutdown_timeout_ms() -> u64 {
    1000
}

fn default_errors_dir() -> PathBuf {
    PathBuf::from("errors")
}

fn default_failure_pause_secs() -> u64 {
    5
}

fn default_update_probability() -> f64 {
    0.1
}

fn default_delete_probability() -> f64 {
    0.1
}

fn default_progress_interval_secs() -> u64 {
    300
}
