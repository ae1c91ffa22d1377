#![allow(dead_code)]

use pg_pb3_fuzzer::config::{Config, PostgresConfig};
use pg_pb3_fuzzer::wire::{self, FieldSetDescription, TableDescription, WireMessage};
use std::env;
use std::sync::{Mutex, MutexGuard};
use tokio_postgres::{Client, NoTls};

/// Live tests share tables and the replication slot, so they run one at a
/// time.
static SERIAL: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 30,
    };

    let mut config = Config {
        postgres,
        ..Default::default()
    };
    config.session.slot_name = format!("pgpb3ldtest_{}", std::process::id());
    config.fuzzer.failure_pause_secs = 0;
    config
}

pub async fn connect(config: &PostgresConfig) -> Client {
    let (client, connection) = config.pg_config().connect(NoTls).await.unwrap();

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Connection error: {}", e);
        }
    });

    client
}

pub const TENK1_FIELD_NAMES: [&str; 16] = [
    "unique1", "unique2", "two", "four", "ten", "twenty", "hundred", "thousand",
    "twothousand", "fivethous", "tenthous", "odd", "even", "stringu1", "stringu2", "string4",
];

pub const TENK1_FIELD_TYPE_OIDS: [u32; 16] =
    [23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 23, 19, 19, 25];

pub const IDENTITY_FULL_FIELD_NAMES: [&str; 2] = ["f1", "f2"];

const FIXTURE_SQL: &str = r#"
DROP TABLE IF EXISTS tenk1;
CREATE TABLE tenk1 (
    unique1     int4,
    unique2     int4,
    two         int4,
    four        int4,
    ten         int4,
    twenty      int4,
    hundred     int4,
    thousand    int4,
    twothousand int4,
    fivethous   int4,
    tenthous    int4,
    odd         int4,
    even        int4,
    stringu1    name,
    stringu2    name,
    string4     text,

    PRIMARY KEY (unique1),
    UNIQUE (unique2)
);
DROP TABLE IF EXISTS tbl_identity_nothing;
CREATE TABLE tbl_identity_nothing (
    f1 int4
);
ALTER TABLE tbl_identity_nothing REPLICA IDENTITY NOTHING;
DROP TABLE IF EXISTS tbl_identity_full;
CREATE TABLE tbl_identity_full (
    f1 int4,
    f2 text
);
ALTER TABLE tbl_identity_full REPLICA IDENTITY FULL;
"#;

/// Fixture tables plus a fresh slot, read through the SQL interface of
/// logical decoding.
pub struct PluginFixture {
    pub client: Client,
    pub slot: String,
}

impl PluginFixture {
    pub async fn setup() -> Self {
        let config = get_test_config();
        let client = connect(&config.postgres).await;

        let row = client.query_one("SHOW is_superuser", &[]).await.unwrap();
        let is_superuser: String = row.get(0);
        assert_eq!(is_superuser, "on", "tests need a superuser");

        client.batch_execute(FIXTURE_SQL).await.unwrap();

        let slot = config.session.slot_name;
        let plugin = config.session.plugin;
        let create = "SELECT pg_create_logical_replication_slot($1, $2)";
        if client.execute(create, &[&slot, &plugin]).await.is_err() {
            client
                .execute("SELECT pg_drop_replication_slot($1)", &[&slot])
                .await
                .unwrap();
            client.execute(create, &[&slot, &plugin]).await.unwrap();
        }

        Self { client, slot }
    }

    /// Run `sql`, then decode everything the slot emits for it under
    /// `options`.
    pub async fn changes(&self, sql: &str, options: &[(&str, &str)]) -> Vec<WireMessage> {
        self.client.batch_execute(sql).await.unwrap();

        let rows = self
            .client
            .query(
                "SELECT data FROM pg_logical_slot_get_binary_changes($1, NULL, NULL, VARIADIC $2)",
                &[&self.slot, &flatten(options)],
            )
            .await
            .unwrap();

        let mut messages = Vec::new();
        for row in rows {
            let data: Vec<u8> = row.get(0);
            messages.extend(wire::decode(&data).unwrap());
        }
        messages
    }

    /// Ask the plugin to start decoding with `options`, returning the
    /// server's error message if it refuses them.
    pub async fn try_options(&self, options: &[(&str, &str)]) -> Result<(), String> {
        self.client
            .query(
                "SELECT data FROM pg_logical_slot_get_binary_changes($1, NULL, 1, VARIADIC $2)",
                &[&self.slot, &flatten(options)],
            )
            .await
            .map(|_| ())
            .map_err(|e| match e.as_db_error() {
                Some(db) => db.message().to_string(),
                None => e.to_string(),
            })
    }

    pub async fn table_oid(&self, table: &str) -> u32 {
        let row = self
            .client
            .query_one("SELECT $1::text::regclass::oid", &[&table])
            .await
            .unwrap();
        row.get(0)
    }

    pub async fn teardown(self) {
        let _ = self
            .client
            .execute("SELECT pg_drop_replication_slot($1)", &[&self.slot])
            .await;
    }
}

fn flatten(options: &[(&str, &str)]) -> Vec<String> {
    options
        .iter()
        .flat_map(|(name, value)| [name.to_string(), value.to_string()])
        .collect()
}

pub fn table(name: &str) -> TableDescription {
    TableDescription {
        schema_name: "public".to_string(),
        table_name: name.to_string(),
        table_oid: 0,
    }
}

pub fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// `n` values, the leading ones given, the rest empty.
pub fn values(n: usize, given: &[&[u8]]) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| given.get(i).map(|v| v.to_vec()).unwrap_or_default())
        .collect()
}

/// Alternating runs of 0 and 1 bytes, starting with 0.
pub fn runs(lengths: &[usize]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut current = 0u8;
    for &len in lengths {
        out.extend(std::iter::repeat(current).take(len));
        current = 1 - current;
    }
    out
}

pub fn field_set(names: Vec<String>, values: Vec<Vec<u8>>, nulls: Vec<u8>) -> FieldSetDescription {
    FieldSetDescription {
        names,
        values,
        nulls,
        ..Default::default()
    }
}
