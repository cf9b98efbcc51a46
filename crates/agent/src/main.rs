//! Stats spout agent
//!
//! Samples per-container resource usage from the container runtime at a
//! fixed interval and republishes it to the configured sink.

use anyhow::{Context, Result};
use clap::Parser;
use spout_lib::{
    engine::{ContainerRegistry, EventMonitor, MonitorExit, PollLoopBuilder, StatsClient},
    health::{components, HealthRegistry},
    observability::{SpoutMetrics, StructuredLogger},
    runtime::{ConnectionFactory, RuntimeClient},
    sink::SinkCatalog,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

use config::{Cli, LogFormat, SpoutConfig};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Why the agent stopped waiting
enum Stop {
    Signal(&'static str),
    Monitor(MonitorExit),
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SpoutConfig::load(&cli)?;
    init_tracing(config.log_format);

    info!("Starting spout-agent");

    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let logger = StructuredLogger::new(host);
    let metrics = SpoutMetrics::new();

    let health_registry = HealthRegistry::new();
    health_registry.register_all();

    // Sink
    let sink = SinkCatalog::with_defaults()
        .create(&config.sink, &config.sinks)
        .await
        .with_context(|| format!("failed to create sink `{}`", config.sink))?;

    // Runtime connection
    let factory = ConnectionFactory::from_config(&config.mode)
        .context("invalid runtime connection settings")?;
    let runtime_target = factory.transport().target();
    let runtime = Arc::new(RuntimeClient::new(factory));
    let registry = Arc::new(ContainerRegistry::new());

    // Lifecycle events first, then the listing, so nothing started or
    // stopped in between is missed
    let monitor = EventMonitor::new(
        runtime.clone(),
        sink.clone(),
        metrics,
        logger.clone(),
        health_registry.clone(),
    );
    monitor
        .start_and_discover(registry.clone())
        .await
        .with_context(|| format!("cannot follow containers at {}", runtime_target))?;
    metrics.set_containers_tracked(registry.len());

    // Worker pool over the persistent connections
    let stats = Arc::new(StatsClient::start(
        runtime.clone(),
        sink.clone(),
        config.worker_count(),
        metrics,
        health_registry.clone(),
    ));
    if let Err(err) = stats.warm_up().await {
        warn!(error = %err, "Could not open every pooled connection, slots will reconnect on use");
        health_registry.set_degraded(components::RUNTIME, err.to_string());
    }

    // API server and poll loop
    let api_shutdown = CancellationToken::new();
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), registry.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, api_shutdown.clone()));

    let poll_shutdown = CancellationToken::new();
    let poll_loop = PollLoopBuilder::new()
        .stats(stats.clone())
        .registry(registry.clone())
        .interval(config.interval())
        .ignore(config.ignore.iter().cloned())
        .metrics(metrics)
        .build()?;
    let poll_handle = tokio::spawn(poll_loop.run(poll_shutdown.clone()));

    health_registry.set_ready(true);
    logger.log_startup(AGENT_VERSION, sink.name(), config.worker_count(), registry.len());

    let stop = tokio::select! {
        reason = shutdown_signal() => Stop::Signal(reason),
        exit = monitor.terminated() => Stop::Monitor(exit),
    };

    let reason = match &stop {
        Stop::Signal(reason) => reason.to_string(),
        Stop::Monitor(exit) => format!("event monitor ended: {:?}", exit),
    };
    logger.log_shutdown(&reason);
    health_registry.set_ready(false);

    // Ordered shutdown: poll loop, event monitor, workers, sink
    poll_shutdown.cancel();
    if let Err(err) = poll_handle.await {
        warn!(error = %err, "Poll loop task failed");
    }
    monitor.close().await;
    stats.shutdown().await;
    sink.close().await;

    api_shutdown.cancel();
    match api_handle.await {
        Ok(Err(err)) => warn!(error = %err, "API server failed"),
        Err(err) => warn!(error = %err, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");

    match stop {
        Stop::Monitor(MonitorExit::Failed(reason)) => {
            anyhow::bail!("runtime event feed failed: {}", reason)
        }
        _ => Ok(()),
    }
}
