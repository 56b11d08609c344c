//! Catalog Sync CLI
//!
//! Syncs the local catalog replica and inspects its state.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use catalog_sync::error::{Result, SyncError};
use catalog_sync::storage::{CatalogStore, Storage, SyncStateStore};
use catalog_sync::sync::{SyncCoordinator, SyncOutcome, SyncPhase};
use catalog_sync::types::*;

#[derive(Parser)]
#[command(name = "catalog-sync")]
#[command(about = "Keep the local catalog replica at the latest published version")]
#[command(version)]
struct Cli {
    /// Database path (defaults to the platform data dir)
    #[arg(long, env = "CATALOG_SYNC_DB_PATH", global = true)]
    db_path: Option<String>,

    /// Storage mode (local or cloud-safe)
    #[arg(long, env = "CATALOG_SYNC_STORAGE_MODE", default_value = "local", global = true)]
    storage_mode: String,

    /// Base URL of the artifact endpoints
    #[arg(
        long,
        env = "CATALOG_SYNC_BASE_URL",
        default_value = "http://127.0.0.1:8787",
        global = true
    )]
    base_url: String,

    /// Client identity for the sync state rows
    #[arg(long, env = "CATALOG_SYNC_CLIENT_ID", default_value = DEFAULT_CLIENT_ID, global = true)]
    client_id: String,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "CATALOG_SYNC_TIMEOUT_MS", default_value = "30000", global = true)]
    timeout_ms: u64,

    /// Attempts per run before giving up on transient failures
    #[arg(long, env = "CATALOG_SYNC_MAX_ATTEMPTS", default_value = "3", global = true)]
    max_attempts: u32,

    /// Emit logs as JSON
    #[arg(long, env = "CATALOG_SYNC_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the replica up to the latest version (Ctrl-C cancels)
    Sync {
        #[arg(short, long, default_value = DEFAULT_DATASET)]
        dataset: String,
    },
    /// Show the local version, record count, and last attempt
    Status {
        #[arg(short, long, default_value = DEFAULT_DATASET)]
        dataset: String,
    },
    /// Show the apply ledger, newest first
    History {
        #[arg(short, long, default_value = DEFAULT_DATASET)]
        dataset: String,
        /// Maximum rows
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Look up records by id
    Lookup {
        #[arg(short, long, default_value = DEFAULT_DATASET)]
        dataset: String,
        /// Record ids
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Resolve the strategy against the remote manifest without applying
    Plan {
        #[arg(short, long, default_value = DEFAULT_DATASET)]
        dataset: String,
    },
}

fn init_logging(json: bool) {
    // stderr only: stdout carries command output
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

fn dataset_arg(dataset: &str) -> Result<String> {
    normalize_dataset(dataset).map_err(|e| SyncError::InvalidInput(e.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    // Expand ~ in path
    let db_path = cli
        .db_path
        .as_deref()
        .map(|p| shellexpand::tilde(p).to_string())
        .unwrap_or_else(StorageConfig::default_db_path);
    let storage_mode: StorageMode = cli.storage_mode.parse().map_err(SyncError::Config)?;

    let storage = Storage::open(StorageConfig {
        db_path,
        storage_mode,
    })?;

    let sync_config = SyncConfig {
        base_url: cli.base_url.clone(),
        client_id: cli.client_id.clone(),
        request_timeout_ms: cli.timeout_ms,
        max_attempts: cli.max_attempts.max(1),
        ..Default::default()
    };

    match cli.command {
        Commands::Sync { dataset } => {
            let coordinator = SyncCoordinator::with_http(storage, sync_config)?;
            let handle = coordinator.start(&dataset)?;

            let canceler = handle.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Canceling after the current step...");
                    canceler.cancel();
                }
            });

            let mut status = handle.subscribe();
            tokio::spawn(async move {
                let mut last: Option<SyncPhase> = None;
                while status.changed().await.is_ok() {
                    let current = status.borrow_and_update().clone();
                    if last != Some(current.phase) {
                        eprintln!(
                            "[{}] step {}/{}",
                            current.phase, current.progress.step, current.progress.total_steps
                        );
                        last = Some(current.phase);
                    }
                }
            });

            let report = handle.wait().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            let code = match report.outcome {
                SyncOutcome::Synced | SyncOutcome::UpToDate => 0,
                SyncOutcome::Canceled => 130,
                SyncOutcome::Retryable => 75,
                SyncOutcome::Failed => 1,
            };
            if code != 0 {
                std::process::exit(code);
            }
        }

        Commands::Status { dataset } => {
            let coordinator = SyncCoordinator::with_http(storage, sync_config)?;
            let status = coordinator.status(&dataset)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::History { dataset, limit } => {
            let dataset = dataset_arg(&dataset)?;
            let store = SyncStateStore::new(storage, cli.client_id);
            for entry in store.history(&dataset, limit)? {
                println!(
                    "#{} {} [{}] {} -> {} ({} ms, +{} ~{} -{}){}",
                    entry.id,
                    entry.applied_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.result.as_str(),
                    entry.from_version.as_deref().unwrap_or("-"),
                    entry.to_version.as_deref().unwrap_or("-"),
                    entry.duration_ms,
                    entry.added_count,
                    entry.updated_count,
                    entry.removed_count,
                    entry
                        .error_message
                        .map(|m| format!(" {}", m))
                        .unwrap_or_default()
                );
            }
        }

        Commands::Lookup { dataset, ids } => {
            let dataset = dataset_arg(&dataset)?;
            let records = CatalogStore::new(storage).lookup(&dataset, &ids)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }

        Commands::Plan { dataset } => {
            let coordinator = SyncCoordinator::with_http(storage, sync_config)?;
            let plan = coordinator.plan(&dataset).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
    }

    Ok(())
}
