//! Game server host agent
//!
//! Runs next to the Docker daemon on each game host: samples container
//! telemetry, fires cron-scheduled lifecycle actions and serves console and
//! live-stats WebSockets.

use agent_lib::{
    collector::TelemetryCollectorBuilder,
    console::ConsoleBridge,
    health::{Component, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    runtime::BackupService,
    scheduler::LifecycleSchedulerBuilder,
    store::SqliteStore,
};
use anyhow::{Context, Result};
use gamehost_agent::{
    api,
    backup::{HttpBackupService, UnconfiguredBackups},
    config::AgentConfig,
    docker::DockerEngine,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting gamehost-agent");

    let config = AgentConfig::load()?;
    info!(
        host_name = %config.host_name,
        database = %config.database_path.display(),
        docker_socket = %config.docker_socket.display(),
        "Agent configured"
    );

    let collection = config.collection_config();
    let health_registry = HealthRegistry::new();
    health_registry
        .register_loop(Component::Collector, collection.interval)
        .await;
    health_registry
        .register_loop(Component::Scheduler, Duration::from_secs(60))
        .await;
    health_registry.register(Component::Store).await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.host_name);
    logger.log_startup(AGENT_VERSION);

    let store = Arc::new(
        SqliteStore::open(&config.database_path).with_context(|| {
            format!("Failed to open database {}", config.database_path.display())
        })?,
    );
    health_registry.set_healthy(Component::Store).await;

    let docker = Arc::new(DockerEngine::new(&config.docker_socket));

    let backups: Arc<dyn BackupService> = match &config.backup_endpoint {
        Some(endpoint) => Arc::new(HttpBackupService::new(endpoint, config.backup_token.clone())?),
        None => {
            warn!("No backup endpoint configured, scheduled backups will fail");
            Arc::new(UnconfiguredBackups)
        }
    };

    let collector = Arc::new(
        TelemetryCollectorBuilder::new()
            .targets(store.clone())
            .samples(store.clone())
            .source(docker.clone())
            .config(collection)
            .health(health_registry.clone())
            .build()?,
    );

    let scheduler = LifecycleSchedulerBuilder::new()
        .schedules(store.clone())
        .targets(store.clone())
        .lifecycle(docker.clone())
        .backups(backups)
        .config(config.scheduler_config())
        .logger(logger.clone())
        .health(health_registry.clone())
        .build()?;

    let console = ConsoleBridge::new(
        store.clone(),
        docker.clone(),
        docker,
        config.console_config(),
    )
    .with_logger(logger.clone());

    collector.start();
    scheduler.start();

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        collector.clone(),
        store,
        console,
    ));

    health_registry.set_ready(true).await;

    let shutdown = CancellationToken::new();
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown.clone().cancelled_owned(),
    ));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    for handle in [collector.stop(), scheduler.stop()].into_iter().flatten() {
        if let Err(e) = handle.await {
            error!(error = %e, "Background loop panicked");
        }
    }

    shutdown.cancel();
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}
