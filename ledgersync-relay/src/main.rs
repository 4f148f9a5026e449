//! LedgerSync Relay Server
//!
//! A self-hostable remote store for encrypted ledger sync. The relay orders
//! opaque envelopes and checks device signatures; it never holds a ledger
//! key or sees plaintext.

mod auth;
mod cleanup;
mod config;
mod error;
mod handlers;
mod rate_limit;
mod server;
mod storage;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ledgersync-relay", about = "LedgerSync relay server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "relay.toml", env = "LEDGERSYNC_RELAY_CONFIG")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long, env = "LEDGERSYNC_RELAY_LISTEN")]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long, env = "LEDGERSYNC_RELAY_DATABASE")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        config::RelayConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        config::RelayConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.storage_path = database;
    }

    tracing::info!("Starting LedgerSync relay on {}", cfg.listen_addr);

    let storage = storage::RelayStorage::open(&cfg.storage_path)?;
    let listen_addr = cfg.listen_addr.clone();
    let state = server::AppState::new(storage, cfg);
    cleanup::spawn_cleanup_task(
        state.storage.clone(),
        state.limiter.clone(),
        state.config.nonce_retention_secs,
        state.config.cleanup_interval_secs,
    );
    let app = server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
