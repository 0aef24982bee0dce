//! futuride-daemon - Unix socket service in front of the execution engine
//!
//! The web layer connects, sends length-prefixed MessagePack requests and gets
//! an `ExecuteResponse` back for every submission.

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use futuride_core::Engine;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod server;

use config::DaemonConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("futuride=info".parse()?))
        .init();

    tracing::info!("futuride-daemon starting");

    let config = DaemonConfig::load()?;
    tracing::info!(
        socket = ?config.socket_path,
        max_concurrent = config.engine.max_concurrent,
        timeout = ?config.engine.timeout,
        "configuration loaded"
    );

    anyhow::ensure!(!config.sweep_interval.is_zero(), "sweep_interval must be non-zero");
    let engine =
        Arc::new(Engine::new(config.engine.clone()).context("invalid engine configuration")?);

    // Create socket directory if needed
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Remove a stale socket from a previous run
    match std::fs::remove_file(&config.socket_path) {
        Ok(()) => tracing::debug!(socket = ?config.socket_path, "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("failed to remove stale socket"),
    }

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("failed to bind {}", config.socket_path.display()))?;
    tracing::info!(socket = ?config.socket_path, "listening");

    let shutdown = CancellationToken::new();

    let signals = Signals::new([SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();
    let signal_task = tokio::spawn(watch_signals(signals, shutdown.clone()));
    let sweep_task = tokio::spawn(sweep_idle_clients(
        Arc::clone(&engine),
        config.sweep_interval,
        shutdown.clone(),
    ));

    server::run(
        listener,
        Arc::clone(&engine),
        config.max_frame_bytes,
        config.shutdown_grace,
        shutdown.clone(),
    )
    .await;

    signals_handle.close();
    shutdown.cancel();
    let (signal_joined, sweep_joined) = tokio::join!(signal_task, sweep_task);
    for (task, joined) in [("signal watcher", signal_joined), ("client sweeper", sweep_joined)] {
        if let Err(e) = joined {
            tracing::error!(task, error = %e, "background task failed");
        }
    }

    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        tracing::warn!(socket = ?config.socket_path, error = %e, "failed to remove socket");
    }

    tracing::info!("futuride-daemon stopped");
    Ok(())
}

async fn watch_signals(mut signals: Signals, shutdown: CancellationToken) {
    if let Some(signal) = signals.next().await {
        tracing::info!(signal, "shutdown signal received");
        shutdown.cancel();
    }
}

async fn sweep_idle_clients(engine: Arc<Engine>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                engine.sweep_idle_clients();
                tracing::debug!(
                    tracked_clients = engine.status().tracked_clients,
                    "rate limiter swept"
                );
            }
        }
    }
}
