//! Model Manager: owns the loaded model and encoder and their load lifecycle.
//!
//! Loads are single-flight. A caller arriving while a load runs waits for it
//! and returns `LoadOutcome::Joined` without doing any work. A caller that
//! waited on the guard but saw no load finish in the meantime runs its own
//! load. The model, the
//! encoder and their `ModelInfo` are published together in one atomic swap, so
//! readers never observe a mix of two loads, and a failed load leaves the
//! previous model serving.

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serving_core::{retry_async, RetryConfig};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::artifact::{cache_path, has_marker, load_model_dir, validate_component};
use crate::config::Settings;
use crate::encoder::{ColumnEncoder, Encoder, EncoderError};
use crate::metrics::ServingMetrics;
use crate::model::Model;
use crate::registry::{model_uri, ModelRegistry};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub cache_root: PathBuf,
    pub encoder_path: PathBuf,
    pub encoder_sha256: Option<String>,
    pub retry: RetryConfig,
}

impl ManagerConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            cache_root: s.model_cache_dir.clone(),
            encoder_path: s.encoder_path.clone(),
            encoder_sha256: s.encoder_sha256.clone(),
            retry: RetryConfig::default().with_max_retries(s.registry_max_retries),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// The version or alias the model was requested by.
    pub version: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded(ModelInfo),
    /// Another load was in flight; this call waited for it and did nothing else.
    Joined,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelLoadError {
    #[error("Registry error: {0}")]
    Registry(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("Model not loaded. Please load the model first.")]
    NotLoaded,
    #[error("Preprocessing error: {0}")]
    Preprocessing(#[source] EncoderError),
    #[error("Prediction failed: {0}")]
    Inference(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction: Value,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Empty,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadSource { Cache, Registry }

impl LoadSource {
    fn as_str(self) -> &'static str {
        match self { Self::Cache => "cache", Self::Registry => "registry" }
    }
}

#[derive(Debug)]
struct LoadedModel {
    model: Arc<dyn Model>,
    encoder: Arc<dyn Encoder>,
    info: ModelInfo,
}

struct Inner {
    config: ManagerConfig,
    registry: Arc<dyn ModelRegistry>,
    metrics: Arc<ServingMetrics>,
    current: ArcSwapOption<LoadedModel>,
    load_guard: Mutex<()>,
    loading: AtomicBool,
    /// Bumped under `load_guard` each time a load attempt finishes.
    completed_loads: AtomicU64,
}

/// Clears the loading flag on every exit path, cancellation included.
struct LoadingFlag<'a>(&'a AtomicBool);

impl<'a> LoadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) { self.0.store(false, Ordering::SeqCst); }
}

#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("state", &self.state())
            .field("model_info", &self.model_info())
            .finish()
    }
}

impl ModelManager {
    pub fn new(
        config: ManagerConfig,
        registry: Arc<dyn ModelRegistry>,
        metrics: Arc<ServingMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                metrics,
                current: ArcSwapOption::empty(),
                load_guard: Mutex::new(()),
                loading: AtomicBool::new(false),
                completed_loads: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_loaded(&self) -> bool { self.inner.current.load().is_some() }

    pub fn is_loading(&self) -> bool { self.inner.loading.load(Ordering::SeqCst) }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.inner.current.load_full().map(|m| m.info.clone())
    }

    pub fn state(&self) -> ManagerState {
        if self.is_loading() {
            ManagerState::Loading
        } else if self.is_loaded() {
            ManagerState::Loaded
        } else {
            ManagerState::Empty
        }
    }

    /// Load `model_name` at `version_alias`, from the local cache when a valid
    /// copy exists and from the registry otherwise.
    pub async fn load_model(
        &self,
        model_name: &str,
        version_alias: &str,
    ) -> Result<LoadOutcome, ModelLoadError> {
        let seen = self.inner.completed_loads.load(Ordering::SeqCst);
        let _guard = match self.inner.load_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(model_name, version_alias, "Model load already in progress");
                let guard = self.inner.load_guard.lock().await;
                if self.inner.completed_loads.load(Ordering::SeqCst) != seen {
                    return Ok(LoadOutcome::Joined);
                }
                // the guard was only held by other waiters
                guard
            }
        };
        let _flag = LoadingFlag::raise(&self.inner.loading);

        let started = Instant::now();
        let mut source = LoadSource::Cache;
        let result = self.load_locked(model_name, version_alias, &mut source).await;
        let elapsed = started.elapsed().as_secs_f64();
        self.inner.completed_loads.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(loaded) => {
                let info = loaded.info.clone();
                self.inner.current.store(Some(Arc::new(loaded)));
                self.inner.metrics.record_load(source.as_str(), "success", elapsed);
                info!(
                    uri = %info.uri,
                    source = source.as_str(),
                    elapsed_secs = elapsed,
                    "Model loaded successfully in {elapsed:.2} seconds from {}",
                    info.uri
                );
                Ok(LoadOutcome::Loaded(info))
            }
            Err(err) => {
                self.inner.metrics.record_load(source.as_str(), "failure", elapsed);
                error!(
                    model_name,
                    version_alias,
                    error = %err,
                    elapsed_secs = elapsed,
                    "Model load failed after {elapsed:.2} seconds"
                );
                if let Some(previous) = self.model_info() {
                    warn!(uri = %previous.uri, "Keeping previously loaded model");
                }
                Err(err)
            }
        }
    }

    async fn load_locked(
        &self,
        name: &str,
        alias: &str,
        source: &mut LoadSource,
    ) -> Result<LoadedModel, ModelLoadError> {
        validate_component(name)
            .and_then(|_| validate_component(alias))
            .map_err(|e| ModelLoadError::Unexpected(e.to_string()))?;
        let uri = model_uri(name, alias);
        let dir = cache_path(&self.inner.config.cache_root, name, alias);
        info!(%uri, cache = %dir.display(), "Loading model");

        let mut cached = None;
        if has_marker(&dir) {
            let d = dir.clone();
            match run_blocking(move || load_model_dir(&d)).await {
                Ok(model) => {
                    info!(path = %dir.display(), "Successfully loaded model from local cache");
                    cached = Some(model);
                }
                Err(e) => warn!(
                    path = %dir.display(),
                    error = %e,
                    "Failed to load model from local cache, falling back to registry"
                ),
            }
        }

        let model = match cached {
            Some(model) => model,
            None => {
                *source = LoadSource::Registry;
                self.fetch_from_registry(name, alias, &dir).await?;
                let d = dir.clone();
                let model = run_blocking(move || load_model_dir(&d))
                    .await
                    .map_err(ModelLoadError::Unexpected)?;
                info!(%uri, "Successfully loaded model from registry");
                model
            }
        };

        let encoder = self.load_encoder().await?;
        Ok(LoadedModel {
            model,
            encoder,
            info: ModelInfo { name: name.to_string(), version: alias.to_string(), uri },
        })
    }

    async fn fetch_from_registry(
        &self,
        name: &str,
        alias: &str,
        dir: &Path,
    ) -> Result<(), ModelLoadError> {
        let registry = &self.inner.registry;
        let retry = &self.inner.config.retry;

        let version = retry_async(retry, |_| registry.resolve(name, alias))
            .await
            .map_err(|e| ModelLoadError::Registry(e.to_string()))?;
        let version = &version;
        info!(model_name = name, version = %version.version, "Downloading model from registry");

        retry_async(retry, move |_| async move {
            reset_dir(dir).await.map_err(|e| {
                ModelLoadError::Unexpected(format!("cannot prepare {}: {e}", dir.display()))
            })?;
            registry
                .download(version, dir)
                .await
                .map_err(|e| ModelLoadError::Registry(e.to_string()))
        })
        .await
    }

    async fn load_encoder(&self) -> Result<Arc<dyn Encoder>, ModelLoadError> {
        let path = self.inner.config.encoder_path.clone();
        let sha256 = self.inner.config.encoder_sha256.clone();
        let encoder = run_blocking(move || ColumnEncoder::from_path(&path, sha256.as_deref()))
            .await
            .map_err(|e| ModelLoadError::Unexpected(format!("failed to load encoder: {e}")))?;
        info!(
            path = %self.inner.config.encoder_path.display(),
            n_features = encoder.n_features_out(),
            "Encoder loaded successfully"
        );
        Ok(Arc::new(encoder))
    }

    /// Encode one feature mapping and run it through the loaded model.
    /// Blocking; async callers should use `spawn_blocking`.
    pub fn predict(&self, features: &Map<String, Value>) -> Result<Prediction, PredictError> {
        let metrics = &self.inner.metrics;
        let Some(loaded) = self.inner.current.load_full() else {
            metrics.record_prediction("not_loaded");
            return Err(PredictError::NotLoaded);
        };

        let timer = metrics.prediction_seconds.start_timer();
        let result = infer(&loaded, features);
        timer.observe_duration();

        match &result {
            Ok(_) => metrics.record_prediction("success"),
            Err(PredictError::Preprocessing(e)) => {
                let input = Value::Object(features.clone());
                error!(error = %e, %input, "Preprocessing failed");
                metrics.record_prediction("preprocessing_error");
            }
            Err(e) => {
                error!(error = %e, "Prediction failed");
                metrics.record_prediction("inference_error");
            }
        }
        result
    }
}

fn infer(loaded: &LoadedModel, features: &Map<String, Value>) -> Result<Prediction, PredictError> {
    let matrix = loaded
        .encoder
        .transform(std::slice::from_ref(features))
        .map_err(PredictError::Preprocessing)?;
    let outputs = loaded
        .model
        .predict(&matrix)
        .map_err(|e| PredictError::Inference(format!("{e:#}")))?;
    let prediction = outputs
        .into_iter()
        .next()
        .ok_or_else(|| PredictError::Inference("model returned no output".into()))?;
    Ok(Prediction { prediction, status: "success".into() })
}

async fn reset_dir(dir: &Path) -> std::io::Result<()> {
    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await
}

async fn run_blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, String>
where
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("blocking task failed: {e}")),
    }
}
