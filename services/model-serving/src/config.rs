//! Environment-backed service settings.

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const SERVICE_NAME: &str = "model-serving";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub api_v1_str: String,
    pub project_name: String,
    pub model_name: Option<String>,
    pub model_version_alias: Option<String>,
    pub mlflow_tracking_uri: String,
    pub mlflow_tracking_token: Option<String>,
    pub mlflow_tracking_username: Option<String>,
    pub mlflow_tracking_password: Option<String>,
    pub model_cache_dir: PathBuf,
    pub encoder_path: PathBuf,
    pub encoder_sha256: Option<String>,
    pub registry_timeout_secs: u64,
    pub registry_max_retries: usize,
    pub host: String,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_v1_str: "/api/v1".into(),
            project_name: "ML Model Serving API".into(),
            model_name: None,
            model_version_alias: None,
            mlflow_tracking_uri: "http://host.docker.internal:8080".into(),
            mlflow_tracking_token: None,
            mlflow_tracking_username: None,
            mlflow_tracking_password: None,
            model_cache_dir: PathBuf::from("model_cache"),
            encoder_path: PathBuf::from("model_cache/encoder/encoder.json"),
            encoder_sha256: None,
            registry_timeout_secs: 300,
            registry_max_retries: 2,
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

impl Settings {
    /// Defaults, then `SERVING_CONFIG_FILE`, then the process environment.
    pub fn load() -> Result<Self> {
        let d = Self::default();
        let builder = config::Config::builder()
            .set_default("api_v1_str", d.api_v1_str)?
            .set_default("project_name", d.project_name)?
            .set_default("mlflow_tracking_uri", d.mlflow_tracking_uri)?
            .set_default("model_cache_dir", d.model_cache_dir.to_string_lossy().into_owned())?
            .set_default("encoder_path", d.encoder_path.to_string_lossy().into_owned())?
            .set_default("registry_timeout_secs", d.registry_timeout_secs as i64)?
            .set_default("registry_max_retries", d.registry_max_retries as i64)?
            .set_default("host", d.host)?
            .set_default("port", d.port as i64)?;
        serving_core::load_config(SERVICE_NAME, builder)
    }

    /// The model to load at startup, when both name and version/alias are set.
    pub fn startup_model(&self) -> Option<(&str, &str)> {
        let name = self.model_name.as_deref().filter(|s| !s.is_empty())?;
        let alias = self.model_version_alias.as_deref().filter(|s| !s.is_empty())?;
        Some((name, alias))
    }

    pub fn registry_timeout(&self) -> Duration { Duration::from_secs(self.registry_timeout_secs) }

    pub fn bind_addr(&self) -> String { format!("{}:{}", self.host, self.port) }
}
