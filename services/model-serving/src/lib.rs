//! Single-model serving service: loads a registered model from an
//! MLflow-compatible registry (through a local disk cache) and serves
//! predictions over HTTP.

pub mod api;
pub mod artifact;
pub mod config;
pub mod encoder;
pub mod manager;
pub mod metrics;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod registry;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::api::AppState;
use crate::config::{Settings, SERVICE_NAME};
use crate::manager::{ManagerConfig, ModelManager};
use crate::metrics::ServingMetrics;
use crate::registry::MlflowRegistry;

/// Build the manager, attempt the startup load, then serve until ctrl-c.
/// A failed startup load is logged and the service keeps running unloaded.
pub async fn run(settings: Settings) -> Result<()> {
    info!(target: "model-serving", project = %settings.project_name, tracking_uri = %settings.mlflow_tracking_uri,
        "Starting {SERVICE_NAME} service");
    tokio::fs::create_dir_all(&settings.model_cache_dir)
        .await
        .with_context(|| format!("creating model cache dir {}", settings.model_cache_dir.display()))?;

    let registry = Arc::new(MlflowRegistry::new(&settings)?);
    let metrics = Arc::new(ServingMetrics::new()?);
    let manager = ModelManager::new(ManagerConfig::from_settings(&settings), registry, metrics.clone());

    match settings.startup_model() {
        Some((name, alias)) => {
            if let Err(e) = manager.load_model(name, alias).await {
                error!(model_name = name, version_alias = alias, error = %e, "Failed to load model on startup");
            }
        }
        None => warn!("MODEL_NAME or MODEL_VERSION_ALIAS not set; starting without a model"),
    }

    let app = api::router(AppState { manager }, &metrics, &settings.api_v1_str);
    let listener = tokio::net::TcpListener::bind(settings.bind_addr())
        .await
        .with_context(|| format!("binding {}", settings.bind_addr()))?;
    info!(addr = %settings.bind_addr(), prefix = %settings.api_v1_str, "listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    info!("shutdown_complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutdown_signal_received");
}
