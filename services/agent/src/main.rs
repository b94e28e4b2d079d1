//! convoy Agent
//!
//! The agent runs on each host and converges its supervised components to
//! the desired policy.
//!
//! ## Architecture
//!
//! - **Config Source**: Publishes desired policies (file, remote or none)
//! - **Coordinator**: Resolves policies and control commands into plans
//! - **Operator**: Executes plans through one worker per component
//! - **Status Reporter**: Aggregates component health into the agent state
//! - **Control API**: Serves state, liveness, restart and upgrade over HTTP

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use convoy_agent::config::{Config, RuntimeMode, SourceMode};
use convoy_agent::control::{self, ControlService};
use convoy_agent::coordinator::Coordinator;
use convoy_agent::operator::Operator;
use convoy_agent::runtime::{LocalRuntime, MockRuntime, ProcessRuntime};
use convoy_agent::source::{ConfigSource, FileSource, NoopSource, RemoteSource};
use convoy_agent::status::{FleetState, StatusReporter};
use convoy_agent::Artifacts;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let fallback = std::env::var("CONVOY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting convoy agent");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        agent_id = %config.agent_id,
        data_dir = %config.data_dir.display(),
        control_addr = %config.control_addr,
        runtime = ?config.runtime,
        "Configuration loaded"
    );

    for dir in [&config.artifacts.download_dir, &config.artifacts.install_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let artifacts = Artifacts::from_config(config.artifacts.clone(), config.retry.clone())
        .context("failed to set up artifact sources")?;

    let runtime: Arc<dyn ProcessRuntime> = match config.runtime {
        RuntimeMode::Local => Arc::new(LocalRuntime::new(config.local_runtime.clone())),
        RuntimeMode::Mock => {
            warn!("Using mock runtime; no processes will be started");
            Arc::new(MockRuntime::new())
        }
    };

    let operator = Arc::new(Operator::new(
        config.operator.clone(),
        artifacts,
        runtime,
        shutdown_rx.clone(),
    ));

    let (policy_tx, policy_rx) = watch::channel(None);
    let (fleet_tx, fleet_rx) = watch::channel(FleetState::standalone());
    let (desired_tx, desired_rx) = watch::channel(Vec::new());
    let (command_tx, command_rx) = mpsc::channel(16);

    let source: Arc<dyn ConfigSource> = match &config.source {
        SourceMode::File { path, interval } => Arc::new(FileSource::new(path, *interval)),
        SourceMode::Remote { url, interval } => Arc::new(
            RemoteSource::new(url.clone(), *interval, config.artifacts.http_timeout, fleet_tx)
                .context("failed to set up remote policy source")?,
        ),
        SourceMode::None => Arc::new(NoopSource),
    };
    info!(source = source.name(), "Policy source configured");

    // Start the policy source
    let source_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { source.run(policy_tx, shutdown_rx).await }
    });

    // Start the coordinator
    let coordinator = Coordinator::new(Arc::clone(&operator), policy_rx, command_rx, desired_tx);
    let coordinator_handle = tokio::spawn(coordinator.run(shutdown_rx.clone()));

    // Start the status reporter
    let reporter = Arc::new(StatusReporter::new(Arc::clone(&operator), desired_rx, fleet_rx));
    let reporter_handle = tokio::spawn({
        let reporter = Arc::clone(&reporter);
        let shutdown_rx = shutdown_rx.clone();
        async move { reporter.run(shutdown_rx).await }
    });

    // Start the control API
    let service = Arc::new(ControlService::new(
        config.agent_id.clone(),
        config.artifacts.snapshot,
        reporter.subscribe(),
        command_tx,
    ));
    let listener = tokio::net::TcpListener::bind(config.control_addr)
        .await
        .with_context(|| format!("failed to bind control API on {}", config.control_addr))?;
    info!(addr = %config.control_addr, "Control API listening");
    let server_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(listener, control::router(service))
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = coordinator_handle => {
            warn!("Coordinator exited");
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Stopping components...");
    operator.shutdown().await;

    let grace = Duration::from_secs(5);
    match tokio::time::timeout(grace, server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Control API error"),
        Ok(Err(e)) => error!(error = %e, "Control API task panicked"),
        Err(_) => warn!("Control API did not stop in time"),
    }
    for handle in [source_handle, reporter_handle] {
        if tokio::time::timeout(grace, handle).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }

    info!("Agent shutdown complete");
    Ok(())
}
