//! Intrusion detection agent
//!
//! Tails the traffic record stream, classifies every new record and serves
//! the control, status, health and metrics API.

use anyhow::{Context, Result};
use ids_lib::{
    health::{components, HealthRegistry},
    observability::{IdsMetrics, StructuredLogger},
    predictor::{ClassificationOracle, FeatureNormalizer, OnnxOracle},
    stream::{read_dataset, CsvFileSource},
    DetectionLedger, MonitoringSupervisorBuilder, FEATURE_COLUMNS,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Load saved normalizer parameters, or fit them from the reference dataset
/// and save them for the next start
fn prepare_normalizer(config: &config::AgentConfig) -> Result<FeatureNormalizer> {
    if config.normalizer_path.exists() {
        return FeatureNormalizer::load(&config.normalizer_path);
    }

    info!(
        path = %config.reference_data_path.display(),
        "No saved normalizer, fitting from reference data"
    );
    let reference = read_dataset(&config.reference_data_path)?;
    let mut normalizer = FeatureNormalizer::new();
    normalizer
        .fit(&reference)
        .context("Failed to fit normalizer on reference data")?;

    if let Err(e) = normalizer.save(&config.normalizer_path) {
        warn!(error = %e, "Failed to save fitted normalizer");
    }
    Ok(normalizer)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting ids-agent");

    let config = config::AgentConfig::load()?;
    info!(
        instance = %config.instance_name,
        stream = %config.stream_path.display(),
        database = %config.database_path.display(),
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::MONITOR).await;
    health_registry.register(components::ORACLE).await;
    health_registry.register(components::LEDGER).await;
    health_registry.register(components::STREAM).await;

    let metrics = IdsMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);

    let ledger = DetectionLedger::open(&config.database_path).with_context(|| {
        format!(
            "Failed to open detection ledger {}",
            config.database_path.display()
        )
    })?;

    let normalizer = match prepare_normalizer(&config) {
        Ok(normalizer) => normalizer,
        Err(e) => {
            warn!(error = %e, "Feature normalizer unavailable, records will be skipped");
            health_registry
                .set_degraded(components::MONITOR, "feature normalizer not fitted")
                .await;
            FeatureNormalizer::new()
        }
    };
    let num_features = if normalizer.is_fitted() {
        normalizer.feature_count()
    } else {
        FEATURE_COLUMNS.len()
    };

    let oracle = match OnnxOracle::from_file(
        &config.model_path,
        num_features,
        config.model_sha256.as_deref(),
    ) {
        Ok(oracle) => oracle,
        Err(e) => {
            warn!(
                error = %e,
                path = %config.model_path.display(),
                "Classification model not loaded, monitoring unavailable"
            );
            health_registry
                .set_unhealthy(components::ORACLE, "classification model not loaded")
                .await;
            OnnxOracle::unloaded()
        }
    };
    let model_version = oracle.model_version().unwrap_or_else(|| "none".to_string());
    metrics.set_model_version(&model_version);
    let model_loaded = oracle.is_loaded();

    let supervisor = MonitoringSupervisorBuilder::new()
        .source(Arc::new(CsvFileSource::new(&config.stream_path)))
        .normalizer(Arc::new(normalizer))
        .oracle(Arc::new(oracle))
        .ledger(ledger)
        .config(config.monitor_config()?)
        .health(health_registry.clone())
        .metrics(metrics.clone())
        .logger(logger.clone())
        .build()?;

    logger.log_startup(AGENT_VERSION, &model_version);

    if config.autostart {
        if model_loaded {
            supervisor.start();
        } else {
            warn!("Autostart requested but no model is loaded");
        }
    }

    let app_state = Arc::new(api::AppState::new(
        supervisor.clone(),
        health_registry.clone(),
        metrics.clone(),
    ));

    health_registry.set_ready(true).await;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = shutdown_rx.await;
    }));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    supervisor.stop().await;

    let _ = shutdown_tx.send(());
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
    }

    info!("Shutdown complete");
    Ok(())
}
