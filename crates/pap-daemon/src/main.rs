//! pap-daemon - PAP control-plane daemon
//!
//! Coordinates a fleet of PDPs over a shared message bus: pushes UPDATE and
//! STATE-CHANGE requests, correlates their asynchronous responses, retries
//! with a bounded budget, and repairs persisted group membership when a PDP
//! fails or goes silent.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pap_core::store::{InMemoryPolicyStore, PolicyStore};
use pap_daemon::activator::PapActivator;
use pap_daemon::config::PapConfig;
use pap_daemon::store::SqlitePolicyStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// PAP control-plane daemon.
#[derive(Parser, Debug)]
#[command(name = "pap-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "pap.toml")]
    config: PathBuf,

    /// Override the bus socket path.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Override the policy store path.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let mut config = if args.config.exists() {
        PapConfig::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        warn!(config = %args.config.display(), "configuration file not found; using defaults");
        PapConfig::default()
    };

    if let Some(socket) = args.socket {
        config.topic.socket = socket;
    }
    if let Some(store) = args.store {
        config.store.path = Some(store);
    }

    let store: Arc<dyn PolicyStore> = match &config.store.path {
        Some(path) => Arc::new(SqlitePolicyStore::open(path)?),
        None => {
            warn!("no store path configured; using a volatile in-memory store");
            Arc::new(InMemoryPolicyStore::default())
        }
    };

    let activator = PapActivator::start(&config, store)?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    activator.stop();
    Ok(())
}
