//! netwatch agent - per-device bandwidth anomaly monitor
//!
//! Polls a telemetry endpoint for device readings, scores each sample
//! against an adaptive per-device model, persists samples and deduplicated
//! notifications, and runs maintenance jobs on their own schedules.

use anyhow::{Context, Result};
use netwatch_lib::{
    health::{components, HealthRegistry},
    maintenance::MaintenanceScheduler,
    monitor::MonitorLoopBuilder,
    observability::{AgentMetrics, StructuredLogger},
    persist::{PersistenceSink, SqliteSink},
    registry::ModelRegistry,
    source::{HttpTelemetrySource, TelemetrySource},
    store::{FsModelStore, ModelStore},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting netwatch-agent");

    let config = config::AgentConfig::load()?;
    info!(
        agent = %config.agent_name,
        endpoint = %config.telemetry_endpoint,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::TELEMETRY).await;
    health_registry.register(components::PERSISTENCE).await;
    health_registry.register(components::MODEL_REGISTRY).await;
    health_registry.register(components::MAINTENANCE).await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.agent_name);
    logger.log_startup(AGENT_VERSION);

    let sink: Arc<dyn PersistenceSink> = Arc::new(
        SqliteSink::open(&config.database_path)
            .with_context(|| format!("Failed to open database at {}", config.database_path))?,
    );
    let source: Arc<dyn TelemetrySource> = Arc::new(
        HttpTelemetrySource::new(&config.telemetry_endpoint, config.telemetry_timeout())
            .context("Failed to build telemetry client")?,
    );
    let store: Arc<dyn ModelStore> = Arc::new(
        FsModelStore::new(&config.model_dir)
            .with_context(|| format!("Failed to prepare model directory {}", config.model_dir))?,
    );

    let (registry, trainer) =
        ModelRegistry::new(store, Arc::clone(&sink), config.training_config());

    let monitor = MonitorLoopBuilder::new()
        .source(Arc::clone(&source))
        .sink(Arc::clone(&sink))
        .registry(Arc::clone(&registry))
        .loop_config(config.loop_config())
        .detector_config(config.detector_config())
        .feature_config(config.feature_config())
        .cooldown(config.cooldown())
        .health(health_registry.clone())
        .logger(logger.clone())
        .build()?;

    let scheduler = MaintenanceScheduler::new(
        Arc::clone(&source),
        Arc::clone(&sink),
        Arc::clone(&registry),
        health_registry.clone(),
        logger.clone(),
        config.maintenance_config(),
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(4);
    tokio::spawn(trainer.run(shutdown_tx.subscribe()));
    tokio::spawn(monitor.run(shutdown_tx.subscribe()));
    tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    tokio::spawn(api::serve(config.api_port, app_state));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");
    let _ = shutdown_tx.send(());

    Ok(())
}
