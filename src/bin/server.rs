//! Catalog Sync artifact server
//!
//! Run with: catalog-sync-server --data-root ./published

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use catalog_sync::error::{Result, SyncError};
use catalog_sync::server::{self, DataRoot};

#[derive(Parser, Debug)]
#[command(name = "catalog-sync-server")]
#[command(about = "Serve published catalog manifests, patches, and snapshots")]
#[command(version)]
struct Args {
    /// Directory holding `<dataset>/manifest.json` and its artifacts
    #[arg(long, env = "CATALOG_SYNC_DATA_ROOT")]
    data_root: String,

    /// Address to bind
    #[arg(long, env = "CATALOG_SYNC_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind
    #[arg(long, env = "CATALOG_SYNC_PORT", default_value = "8787")]
    port: u16,

    /// Emit logs as JSON
    #[arg(long, env = "CATALOG_SYNC_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if args.log_json {
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

    let root = PathBuf::from(shellexpand::tilde(&args.data_root).to_string());
    if !root.is_dir() {
        return Err(SyncError::Config(format!(
            "Data root is not a directory: {}",
            root.display()
        )));
    }

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|e| SyncError::Config(format!("Invalid bind address: {}", e)))?;

    server::start(addr, Arc::new(DataRoot::new(root))).await?;
    Ok(())
}
