//! podnet local pod
//!
//! Runs one pod: its SQLite store, its published service contracts and the iroh
//! endpoint other pods query it through. Contracts are re-read on SIGHUP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use service::{Config, ServiceState};

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// podnet local pod
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file, flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to SQLite database file
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Path to the pod's secret key (PEM), created if missing
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Path to this pod's network membership credential (JSON)
    #[arg(long)]
    credential: Option<PathBuf>,

    /// Service contract to publish, may be given more than once
    #[arg(long = "contract")]
    contracts: Vec<PathBuf>,

    /// Port for the peer to listen on (for p2p networking)
    #[arg(long)]
    peer_port: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = match self.config {
            Some(ref path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(db_path) = self.database {
            config.sqlite_path = Some(db_path);
        }
        if let Some(key_path) = self.key {
            config.key_path = Some(key_path);
        }
        if let Some(credential_path) = self.credential {
            config.credential_path = Some(credential_path);
        }
        if !self.contracts.is_empty() {
            config.contract_paths = self.contracts;
        }
        if let Some(peer_port) = self.peer_port {
            config.peer_listen_addr = Some(SocketAddr::from_str(&format!("0.0.0.0:{}", peer_port))?);
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;

    // Initialize tracing
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.log_level()?.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stdout_layer).init();

    tracing::info!("Starting podnet pod");

    // Create state
    let state = match ServiceState::from_config(&config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Failed to create service state: {}", e);
            std::process::exit(1);
        }
    };

    // Set up graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let graceful_shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl+c: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    };
    tokio::spawn(graceful_shutdown);

    let mut handles = Vec::new();

    // Spawn peer
    let endpoint = state.endpoint().clone();
    let protocol = state.protocol();
    let peer_rx = shutdown_rx.clone();
    let peer_handle = tokio::spawn(async move {
        if let Err(e) = common::peer::spawn(endpoint, protocol, peer_rx).await {
            tracing::error!("Peer error: {}", e);
        }
    });
    handles.push(peer_handle);

    // Purge expired entries
    if let Some(interval) = config.purge_interval() {
        let purge_state = state.clone();
        let purge_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(run_purger(purge_state, interval, purge_rx)));
    }

    // Reload contracts on SIGHUP
    #[cfg(unix)]
    {
        let reload_state = state.clone();
        let reload_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_reloader(reload_state, reload_rx).await {
                tracing::error!("Contract reloader error: {}", e);
            }
        }));
    }

    // Wait for shutdown
    let _ = shutdown_rx.clone().changed().await;

    // Wait for all handles with timeout
    let _ = tokio::time::timeout(
        FINAL_SHUTDOWN_TIMEOUT,
        futures::future::join_all(handles),
    )
    .await;

    tracing::info!("Pod shutdown complete");
    Ok(())
}

async fn run_purger(state: ServiceState, interval: Duration, mut shutdown_rx: watch::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match state.dispatcher().purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!("purged {} expired entries", purged),
                    Err(e) => tracing::warn!("failed to purge expired entries: {}", e),
                }
            }
            _ = shutdown_rx.changed() => return,
        }
    }
}

#[cfg(unix)]
async fn run_reloader(state: ServiceState, mut shutdown_rx: watch::Receiver<()>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                let published = state.reload_contracts();
                tracing::info!("contract reload published {} new versions", published);
            }
            _ = shutdown_rx.changed() => return Ok(()),
        }
    }
}
