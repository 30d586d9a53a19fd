use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_server::ServerConfig;
use relay_store::{CredentialStore, Database, MessageRepo};
use relay_telemetry::{LogFormat, TelemetryConfig};
use tracing::Level;

/// Real-time group chat relay.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Cli {
    /// Host to bind.
    #[arg(long, env = "RELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 picks a free port).
    #[arg(long, env = "RELAY_PORT", default_value_t = 8000)]
    port: u16,

    /// SQLite database file. Defaults to ~/.relay/relay.db.
    #[arg(long, env = "RELAY_DB")]
    db: Option<PathBuf>,

    /// Default log level.
    #[arg(long, env = "RELAY_LOG", default_value_t = Level::INFO)]
    log_level: Level,

    /// Log output format: json or pretty.
    #[arg(long, env = "RELAY_LOG_FORMAT", default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Maximum concurrent WebSocket connections.
    #[arg(long, env = "RELAY_MAX_CONNECTIONS", default_value_t = 256)]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    relay_telemetry::init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        format: cli.log_format,
        ..Default::default()
    })?;

    let db_path = cli.db.unwrap_or_else(default_db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        max_connections: cli.max_connections,
        ..Default::default()
    };
    let log = Arc::new(MessageRepo::new(db.clone()));
    let gate = Arc::new(CredentialStore::new(db));
    let handle = relay_server::start(config, log, gate)
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port(), "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".relay")
        .join("relay.db")
}
