use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::{config, start, RelayServices};
use relay_store::{Database, SqliteStore};
use relay_telemetry::init_telemetry;

#[derive(Parser)]
#[command(author, version, about = "Real-time chat relay")]
struct Args {
    /// Config file; falls back to `RELAY_CONFIG`, then `relay.json`.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    }
    .context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let _telemetry = init_telemetry(config.logging.to_telemetry()?);

    let db = Database::open(&config.database.path)
        .with_context(|| format!("failed to open {}", config.database.path.display()))?;
    let services = RelayServices::new(Arc::new(SqliteStore::new(db)));

    let handle = start(config, services)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "relay ready");

    shutdown_signal().await;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
