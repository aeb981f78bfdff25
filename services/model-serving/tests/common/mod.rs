#![allow(dead_code)]

use async_trait::async_trait;
use model_serving::artifact::MARKER_FILE;
use model_serving::manager::{ManagerConfig, ModelManager};
use model_serving::metrics::ServingMetrics;
use model_serving::registry::{ModelRegistry, ModelVersion, RegistryError};
use parking_lot::Mutex;
use serving_core::RetryConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

/// age + scaled income + one-hot city; 52.5 for {age: 30, income: 60000, city: porto}.
pub const MODEL_JSON: &str = r#"{"coefficients": [[1.0, 2.0, 10.0, 20.0]], "intercepts": [0.5]}"#;
/// Constant 7.0 whatever the input.
pub const OTHER_MODEL_JSON: &str = r#"{"coefficients": [[0.0, 0.0, 0.0, 0.0]], "intercepts": [7.0]}"#;

pub const ENCODER_JSON: &str = r#"{"columns": [
    {"name": "age", "kind": "passthrough"},
    {"name": "income", "kind": "standard", "mean": 50000.0, "scale": 10000.0},
    {"name": "city", "kind": "one_hot", "categories": ["lisbon", "porto"]}
]}"#;

const DESCRIPTOR: &str = "artifact_path: model\nrun_id: 0a1b2c\nflavors:\n  linear:\n    model_file: model.json\n";

pub fn write_artifact(dir: &Path, model_json: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("model.json"), model_json).unwrap();
    std::fs::write(dir.join(MARKER_FILE), DESCRIPTOR).unwrap();
}

pub fn features(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    v.as_object().cloned().unwrap()
}

/// Scratch cache root, encoder artifact and a registry-side artifact source.
pub struct Fixture {
    pub root: TempDir,
    pub cache: PathBuf,
    pub encoder: PathBuf,
    pub remote: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let cache = root.path().join("cache");
        let encoder = root.path().join("encoder/encoder.json");
        let remote = root.path().join("remote");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::create_dir_all(encoder.parent().unwrap()).unwrap();
        std::fs::write(&encoder, ENCODER_JSON).unwrap();
        write_artifact(&remote, MODEL_JSON);
        Self { root, cache, encoder, remote }
    }

    pub fn cache_dir(&self, name: &str, alias: &str) -> PathBuf { self.cache.join(name).join(alias) }

    pub fn seed_cache(&self, name: &str, alias: &str, model_json: &str) {
        write_artifact(&self.cache_dir(name, alias), model_json);
    }

    pub fn config(&self) -> ManagerConfig {
        ManagerConfig {
            cache_root: self.cache.clone(),
            encoder_path: self.encoder.clone(),
            encoder_sha256: None,
            retry: RetryConfig { max_retries: 2, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5), jitter: 0.0 },
        }
    }

    pub fn registry(&self) -> Arc<FakeRegistry> { Arc::new(FakeRegistry::new(self.remote.clone())) }

    /// Registry whose downloads block until `gate` is notified.
    pub fn gated_registry(&self) -> Arc<FakeRegistry> { Arc::new(FakeRegistry::new(self.remote.clone()).gated()) }

    pub fn manager(&self, registry: Arc<FakeRegistry>) -> (ModelManager, Arc<ServingMetrics>) {
        self.manager_with(self.config(), registry)
    }

    pub fn manager_with(&self, config: ManagerConfig, registry: Arc<FakeRegistry>) -> (ModelManager, Arc<ServingMetrics>) {
        let metrics = Arc::new(ServingMetrics::new().unwrap());
        (ModelManager::new(config, registry, metrics.clone()), metrics)
    }
}

/// In-memory registry serving the artifact under `source`.
pub struct FakeRegistry {
    source: PathBuf,
    calls: Mutex<Vec<String>>,
    download_attempts: AtomicUsize,
    fail_first: AtomicUsize,
    fail_all: AtomicBool,
    gated: AtomicBool,
    /// Notified when a download starts.
    pub entered: Notify,
    /// Gated downloads wait on this before copying.
    pub gate: Notify,
}

impl FakeRegistry {
    pub fn new(source: PathBuf) -> Self {
        Self {
            source,
            calls: Mutex::new(Vec::new()),
            download_attempts: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(0),
            fail_all: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            entered: Notify::new(),
            gate: Notify::new(),
        }
    }

    pub fn gated(self) -> Self { self.gated.store(true, Ordering::SeqCst); self }
    pub fn fail_first(&self, n: usize) { self.fail_first.store(n, Ordering::SeqCst); }
    pub fn fail_all(&self, on: bool) { self.fail_all.store(on, Ordering::SeqCst); }

    pub fn calls(&self) -> Vec<String> { self.calls.lock().clone() }
    pub fn download_attempts(&self) -> usize { self.download_attempts.load(Ordering::SeqCst) }
}

#[async_trait]
impl ModelRegistry for FakeRegistry {
    async fn resolve(&self, name: &str, version_alias: &str) -> Result<ModelVersion, RegistryError> {
        self.calls.lock().push(format!("resolve:{name}@{version_alias}"));
        Ok(ModelVersion { name: name.to_string(), version: "3".into(), source: None, run_id: Some("0a1b2c".into()) })
    }

    async fn download(&self, version: &ModelVersion, dst: &Path) -> Result<(), RegistryError> {
        self.calls.lock().push(format!("download:{}/{}", version.name, version.version));
        self.entered.notify_one();
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        let attempt = self.download_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) || attempt < self.fail_first.load(Ordering::SeqCst) {
            return Err(RegistryError::Api { status: 503, code: "TEMPORARILY_UNAVAILABLE".into(), message: "registry unavailable".into() });
        }
        let mut names: Vec<String> = std::fs::read_dir(&self.source)
            .map_err(|source| RegistryError::Io { path: self.source.clone(), source })?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort_by_key(|n| n == MARKER_FILE);
        for n in names {
            std::fs::copy(self.source.join(&n), dst.join(&n))
                .map_err(|source| RegistryError::Io { path: dst.join(&n), source })?;
        }
        Ok(())
    }
}
