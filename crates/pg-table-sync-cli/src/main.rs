//! pg-table-sync CLI - load JSON datasets into PostgreSQL tables.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pg_table_sync::{
    Config, PgSynchronizer, Queryable, Result, SyncError, Synchronizable, TabularDataset,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code when an operation is interrupted by a signal.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "pg-table-sync")]
#[command(about = "Synchronize JSON datasets into PostgreSQL tables")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON results to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test the database connection
    HealthCheck,

    /// Run a read-only query and print the rows as JSON
    Query {
        /// SQL text of the query
        sql: String,
    },

    /// Run a single non-query statement in its own transaction
    Execute {
        /// SQL text of the statement
        sql: String,
    },

    /// Create a table inferred from a dataset if it does not exist
    EnsureTable {
        /// Target table, `schema.table` or a bare name in the configured schema
        #[arg(short, long)]
        table: String,

        /// JSON file holding an array of flat objects
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Append a dataset to a table without conflict resolution
    Insert {
        /// Target table, `schema.table` or a bare name in the configured schema
        #[arg(short, long)]
        table: String,

        /// JSON file holding an array of flat objects
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Update rows matching on the conflict columns and insert the rest
    Upsert {
        /// Target table, `schema.table` or a bare name in the configured schema
        #[arg(short, long)]
        table: String,

        /// Conflict column (repeat for composite keys)
        #[arg(long = "conflict", required = true, num_args = 1..)]
        conflict: Vec<String>,

        /// JSON file holding an array of flat objects
        #[arg(short, long)]
        input: PathBuf,
    },
}

/// How a command ended without error.
enum Completion {
    Done,
    Cancelled,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(Completion::Done) => ExitCode::SUCCESS,
        Ok(Completion::Cancelled) => {
            eprintln!("Operation cancelled; open transaction rolled back");
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<Completion> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler();

    let sync = match cancellable(&cancel_token, PgSynchronizer::connect(config)).await? {
        Some(sync) => sync,
        None => return Ok(Completion::Cancelled),
    };

    match cli.command {
        Commands::HealthCheck => {
            let start = std::time::Instant::now();
            sync.health_check().await?;
            let latency = start.elapsed().as_millis();
            if cli.output_json {
                println!(
                    "{}",
                    serde_json::json!({ "healthy": true, "latency_ms": latency })
                );
            } else {
                println!("Connection OK ({}ms)", latency);
            }
        }

        Commands::Query { sql } => {
            let Some(dataset) = cancellable(&cancel_token, sync.query(&sql)).await? else {
                return Ok(Completion::Cancelled);
            };
            println!("{}", serde_json::to_string_pretty(&dataset_to_json(&dataset))?);
        }

        Commands::Execute { sql } => {
            let Some(affected) = cancellable(&cancel_token, sync.execute(&sql)).await? else {
                return Ok(Completion::Cancelled);
            };
            if cli.output_json {
                println!("{}", serde_json::json!({ "rows_affected": affected }));
            } else {
                println!("{} rows affected", affected);
            }
        }

        Commands::EnsureTable { table, input } => {
            let table = sync.table_ref(&table)?;
            let dataset = load_dataset(&input)?;
            let schema = sync.infer_schema(&table, &dataset)?;

            let Some(()) = cancellable(&cancel_token, sync.ensure_table(&schema)).await? else {
                return Ok(Completion::Cancelled);
            };
            println!("Table {} ensured", table);
            for col in &schema.columns {
                let seen_null = if col.nullable { " (nulls seen)" } else { "" };
                println!("  {} {}{}", col.name, col.sql_type, seen_null);
            }
        }

        Commands::Insert { table, input } => {
            let table = sync.table_ref(&table)?;
            let dataset = load_dataset(&input)?;

            let Some(inserted) =
                cancellable(&cancel_token, sync.bulk_insert(&table, &dataset)).await?
            else {
                return Ok(Completion::Cancelled);
            };
            if cli.output_json {
                println!("{}", serde_json::json!({ "rows_inserted": inserted }));
            } else {
                println!("Inserted {} rows into {}", inserted, table);
            }
        }

        Commands::Upsert {
            table,
            conflict,
            input,
        } => {
            let table = sync.table_ref(&table)?;
            let dataset = load_dataset(&input)?;

            let Some(outcome) =
                cancellable(&cancel_token, sync.upsert(&table, &dataset, &conflict)).await?
            else {
                return Ok(Completion::Cancelled);
            };
            if cli.output_json {
                println!("{}", serde_json::to_string(&outcome)?);
            } else {
                println!("Upsert into {} completed!", table);
                println!("  Updated: {}", outcome.rows_updated);
                println!("  Inserted: {}", outcome.rows_inserted);
            }
        }
    }

    Ok(Completion::Done)
}

/// Run `operation` until it completes or `token` is cancelled.
///
/// Cancellation drops the operation future, which rolls back its open
/// transaction and returns its connection. Yields `None` in that case.
async fn cancellable<T>(
    token: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<Option<T>> {
    tokio::select! {
        result = operation => result.map(Some),
        _ = token.cancelled() => Ok(None),
    }
}

/// Read a JSON array of flat objects into a dataset.
fn load_dataset(path: &Path) -> Result<TabularDataset> {
    let content = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    match value {
        serde_json::Value::Array(records) => {
            let dataset = TabularDataset::from_json_records(&records)?;
            info!(
                "Loaded {} rows x {} columns from {:?}",
                dataset.len(),
                dataset.num_columns(),
                path
            );
            Ok(dataset)
        }
        _ => Err(SyncError::bulk_load(
            path.display().to_string(),
            "input must be a JSON array of objects",
        )),
    }
}

fn dataset_to_json(dataset: &TabularDataset) -> serde_json::Value {
    let rows = dataset
        .rows()
        .iter()
        .map(|row| {
            let obj = dataset
                .columns()
                .iter()
                .cloned()
                .zip(row.iter().map(|v| v.to_json()))
                .collect::<serde_json::Map<_, _>>();
            serde_json::Value::Object(obj)
        })
        .collect();
    serde_json::Value::Array(rows)
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // logs go to stderr so that --output-json and query output stay parseable
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for cancellation.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Cancelling...", name);
                    token.cancel();
                });
            }
            Err(e) => warn!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Cancelling...");
            token.cancel();
        }
    });

    cancel_token
}
