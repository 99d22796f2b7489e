//! # relay-node
//!
//! Chat relay process binary: loads settings, connects to the shared store,
//! and serves WebSocket sessions until signalled.

#![deny(unsafe_code)]

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use relay_core::ProcessId;
use relay_server::{RelayServer, ServerConfig, ensure_counter_initialized};
use relay_settings::RelaySettings;
use relay_store::RedisStore;
use tracing::{error, info, warn};

/// Chat relay process.
#[derive(Parser, Debug)]
#[command(name = "relay-node", about = "Horizontally scaled chat relay process")]
struct Cli {
    /// JSON settings file, deep-merged over defaults.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings and `HOST`).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings and `PORT`).
    #[arg(long)]
    port: Option<u16>,

    /// Shared store endpoint, e.g. `redis://127.0.0.1:6379`.
    #[arg(long)]
    redis_endpoint: Option<String>,
}

impl Cli {
    /// Apply flags as the highest-priority settings layer.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(endpoint) = &self.redis_endpoint {
            settings.store.endpoint = Some(endpoint.clone());
        }
    }
}

/// Configured identity, or a fresh one.
fn process_id(settings: &RelaySettings) -> ProcessId {
    settings
        .process_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map_or_else(ProcessId::new, ProcessId::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings =
        relay_settings::load_settings(args.config.as_deref()).context("Failed to load settings")?;
    args.apply(&mut settings);

    logging::init(&settings.logging);
    run(settings).await
}

async fn run(settings: RelaySettings) -> Result<()> {
    let endpoint = settings
        .require_store_endpoint()
        .context("No store endpoint configured (set REDIS_ENDPOINT or --redis-endpoint)")?;
    let process_id = process_id(&settings);
    info!(process = %process_id, version = relay_core::constants::VERSION, "starting relay");

    let store = RedisStore::connect(endpoint, settings.store.operation_timeout())
        .await
        .context("Failed to reach the shared store")?;
    let _ = ensure_counter_initialized(&store)
        .await
        .context("Failed to initialize the shared connection count")?;

    let metrics = relay_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let config = ServerConfig::from(&settings);
    let grace = config.shutdown_grace();
    let server = RelayServer::new(config, process_id, Arc::new(store)).with_metrics(metrics);

    let egress = server
        .start_egress()
        .await
        .context("Failed to subscribe to broadcast topics")?;
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!("relay listening on http://{addr}");

    let egress_failed = tokio::select! {
        result = shutdown_signal() => {
            result?;
            info!("shutdown signal received");
            false
        }
        (exit, _, _) = futures::future::select_all(egress) => {
            error!(?exit, "egress loop ended, shutting down");
            true
        }
    };

    // Drain and the HTTP task share one budget.
    let deadline = tokio::time::Instant::now() + grace;
    match server.drain(deadline).await {
        Some(outcome) => info!(?outcome, "reconcile complete"),
        None => warn!("shared connection count may be stale"),
    }
    if tokio::time::timeout_at(deadline, handle).await.is_err() {
        warn!("http server did not stop within the grace period");
    }

    if egress_failed {
        bail!("egress stopped unexpectedly");
    }
    info!("shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, `SIGTERM`.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}
