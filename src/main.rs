use anyhow::Context;
use clap::{Parser, Subcommand};
use pg_pb3_fuzzer::fuzzer::RunSummary;
use pg_pb3_fuzzer::options::BinaryOidRanges;
use pg_pb3_fuzzer::{Config, Fuzzer};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-pb3-fuzzer")]
#[command(about = "Differential fuzzer for the pg_pb3_ld logical decoding output plugin", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, global = true, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fuzz randomly generated tables until interrupted
    Fuzz {
        #[arg(long, help = "Seed for the schema generator (random if omitted)")]
        seed: Option<u64>,
        #[arg(long, default_value_t = 0, help = "Skip to this table of the run, as named in a failure report")]
        start_at: usize,
        #[arg(long, help = "Stop after this many tables")]
        max_schemas: Option<usize>,
        #[arg(long, help = "Cap on transactions per table")]
        max_transactions: Option<usize>,
    },
    /// Walk identifier and value lengths around every varint width boundary
    Exhaustive {
        #[arg(long, help = "Also test values of 268435455 to 268435457 bytes")]
        extended: bool,
    },
    /// Run randomized tables under every plugin option combination
    Matrix {
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value_t = 3, help = "Tables per option combination")]
        schemas: usize,
        #[arg(long, default_value_t = 20, help = "Cap on transactions per table")]
        max_transactions: usize,
    },
    /// Validate a binary_oid_ranges value and print its canonical form
    CheckRanges { value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    if let Command::CheckRanges { value } = &args.command {
        let ranges: BinaryOidRanges = value
            .parse()
            .with_context(|| format!("invalid binary_oid_ranges {:?}", value))?;
        println!("{}", ranges);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Config::from_file(path)
        }
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;

    match &args.command {
        Command::Fuzz {
            max_transactions, ..
        } if max_transactions.is_some() => {
            config.fuzzer.max_transactions_per_schema = *max_transactions;
        }
        Command::Exhaustive { extended: true } => config.fuzzer.extended_boundaries = true,
        Command::Matrix {
            max_transactions, ..
        } => config.fuzzer.max_transactions_per_schema = Some(*max_transactions),
        _ => {}
    }

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        slot = %config.session.slot_name,
        plugin = %config.session.plugin,
        errors_dir = %config.fuzzer.errors_dir.display(),
        "Configuration summary"
    );

    let mut fuzzer = Fuzzer::connect(config)
        .await
        .context("Failed to start fuzzer")?;

    let run = async {
        match &args.command {
            Command::Fuzz {
                seed,
                start_at,
                max_schemas,
                ..
            } => {
                fuzzer
                    .run_fuzz_from(seed_or_random(*seed), *start_at, *max_schemas)
                    .await
            }
            Command::Exhaustive { .. } => fuzzer.run_exhaustive().await,
            Command::Matrix { seed, schemas, .. } => {
                fuzzer.run_matrix(seed_or_random(*seed), *schemas).await
            }
            Command::CheckRanges { .. } => Ok(RunSummary::default()),
        }
    };

    let result = tokio::select! {
        result = run => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            None
        }
    };

    if let Err(e) = fuzzer.close().await {
        warn!("Error while closing fuzzer: {}", e);
    }

    match result {
        None => Ok(()),
        Some(Ok(summary)) => {
            info!(
                schemas = summary.schemas,
                transactions = summary.transactions,
                failures = summary.failures,
                "Run complete"
            );
            if summary.failures > 0 {
                anyhow::bail!(
                    "{} of {} tables failed",
                    summary.failures,
                    summary.schemas
                );
            }
            Ok(())
        }
        Some(Err(e)) => {
            error!("Fuzzer stopped: {}", e);
            Err(e.into())
        }
    }
}

fn seed_or_random(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(rand::random)
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_pb3_fuzzer=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_pb3_fuzzer=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
