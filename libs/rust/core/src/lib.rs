//! Core shared utilities for the model serving services.

use anyhow::Result;
use tracing::info;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use config::{builder::DefaultState, ConfigBuilder};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Env var naming an optional config file layered below the environment.
pub const CONFIG_FILE_ENV: &str = "SERVING_CONFIG_FILE";

pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("SERVING_JSON_LOG").ok().map(|v| v=="1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry.with(tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false))
                .try_init()?;
        } else {
            registry.with(tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "serving-core", service, "Tracing initialized");
    Ok(())
}

/// Layer the optional config file and the process environment over `builder`
/// (which carries the caller's defaults) and deserialize the result.
///
/// Environment keys are matched case-insensitively, so `MODEL_NAME` fills `model_name`.
pub fn load_config<T: DeserializeOwned>(service: &str, builder: ConfigBuilder<DefaultState>) -> Result<T> {
    let mut builder = builder.set_default("service_name", service)?;
    if let Ok(file) = std::env::var(CONFIG_FILE_ENV) {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::default());
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

mod resilience;
pub use resilience::{retry_async, RetryConfig};
pub mod metrics;
pub use metrics::{metrics_router, render_metrics};
