//! deviceplane Device Agent
//!
//! Registers the device, polls the controller for the desired bundle and
//! garbage-collects observations the bundle no longer backs.
//!
//! The binary runs with [`LoggingSupervisor`], which logs the desired state
//! without realizing it.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use deviceplane_agent::config::LogFormat;
use deviceplane_agent::{Agent, AgentError, Cli, Config, LoggingSupervisor, ShutdownSignal};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Agent failed");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_cli(Cli::parse())?;
    init_tracing(&config);

    let shutdown = ShutdownSignal::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Received shutdown signal");
            shutdown.trigger();
        }
    });

    let agent = match Agent::start(
        config,
        Arc::new(LoggingSupervisor::new()),
        None,
        shutdown.clone(),
    )
    .await
    {
        Ok(agent) => agent,
        Err(AgentError::Canceled) => {
            info!("Shutdown requested before registration completed");
            return Ok(());
        }
        Err(e) => return Err(e).context("failed to start agent"),
    };

    let mut shutdown_rx = shutdown.subscribe();
    let _ = shutdown_rx.wait_for(|stopped| *stopped).await;

    let aborted = agent.stop().await;
    if !aborted.is_empty() {
        info!(aborted = ?aborted, "Some tasks were aborted during shutdown");
    }
    Ok(())
}

fn init_tracing(config: &Config) {
    // RUST_LOG takes precedence over --log-level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
