#![warn(missing_docs)]

//! ClaudeFS NFSv4 state registry daemon

use anyhow::Result;
use clap::Parser;
use claudefs_nfs4state::{spawn_reapers, StableStorage, StateConfig, StateRegistry, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// NFSv4 state registry daemon.
#[derive(Parser, Debug)]
#[command(name = "cfs-nfs4state", version, about)]
struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, env = "CFS_NFS4STATE_CONFIG", default_value = "/etc/claudefs/nfs4state.toml")]
    config: PathBuf,

    /// Skip the startup grace period
    #[arg(long)]
    no_grace: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::info!("ClaudeFS NFSv4 state registry starting...");

    let config = if cli.config.exists() {
        StateConfig::from_file(&cli.config)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        StateConfig::default()
    };
    config.validate()?;

    let storage = StableStorage::local(config.record_owner);
    let reaper_enabled = config.reaper_enabled;
    let registry = Arc::new(StateRegistry::new(config, Arc::new(SystemClock), storage));

    let recovered = registry.recover();
    tracing::info!(recovered, "stable storage recovered");
    if cli.no_grace {
        tracing::warn!("grace period skipped; clients cannot reclaim state");
    } else {
        registry.start_grace();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reapers = if reaper_enabled {
        spawn_reapers(registry.clone(), shutdown_rx)
    } else {
        Vec::new()
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    for handle in reapers {
        if let Err(e) = handle.await {
            tracing::error!("reaper task failed: {}", e);
        }
    }
    registry.shutdown();
    Ok(())
}
