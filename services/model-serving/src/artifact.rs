//! On-disk model artifact layout.
//!
//! A cached artifact lives at `cache_root/<model_name>/<version_alias>/` and is
//! considered complete once its `MLmodel` descriptor exists. The descriptor
//! names one or more flavors; the first supported one is loaded.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::model::{LinearModel, Model};

pub const MARKER_FILE: &str = "MLmodel";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid path component {0:?}")]
    InvalidComponent(String),
    #[error("failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("malformed MLmodel descriptor: {0}")]
    Descriptor(#[from] serde_yaml::Error),
    #[error("no supported flavor in MLmodel (found: {0})")]
    UnsupportedFlavor(String),
    #[error("flavor '{flavor}' failed to load: {reason}")]
    Flavor { flavor: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactDescriptor {
    #[serde(default)]
    pub artifact_path: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub model_uuid: Option<String>,
    #[serde(default)]
    pub utc_time_created: Option<String>,
    pub flavors: Flavors,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Flavors {
    #[serde(default)]
    pub linear: Option<LinearFlavor>,
    #[serde(default)]
    pub onnx: Option<OnnxFlavor>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinearFlavor {
    #[serde(default = "default_linear_file")]
    pub model_file: String,
}
fn default_linear_file() -> String { "model.json".into() }

#[derive(Debug, Clone, Deserialize)]
pub struct OnnxFlavor {
    #[serde(default = "default_onnx_file")]
    pub data: String,
    #[serde(default)]
    pub input_dim: Option<usize>,
}
fn default_onnx_file() -> String { "model.onnx".into() }

impl Flavors {
    fn names(&self) -> String {
        let mut names: Vec<&str> = self.other.keys().map(String::as_str).collect();
        if self.linear.is_some() { names.push("linear"); }
        if self.onnx.is_some() { names.push("onnx"); }
        if names.is_empty() { "none".into() } else { names.join(", ") }
    }
}

/// Reject anything that would not stay a single directory level under the cache root.
pub fn validate_component(s: &str) -> Result<(), ArtifactError> {
    if s.is_empty() || s == "." || s == ".." || s.contains('/') || s.contains('\\') {
        return Err(ArtifactError::InvalidComponent(s.to_string()));
    }
    Ok(())
}

pub fn cache_path(cache_root: &Path, model_name: &str, version_alias: &str) -> PathBuf {
    cache_root.join(model_name).join(version_alias)
}

pub fn has_marker(dir: &Path) -> bool { dir.join(MARKER_FILE).is_file() }

pub fn read_descriptor(dir: &Path) -> Result<ArtifactDescriptor, ArtifactError> {
    let path = dir.join(MARKER_FILE);
    let text = std::fs::read_to_string(&path).map_err(|source| ArtifactError::Io { path, source })?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Load the first supported flavor of the artifact in `dir`. Blocking.
pub fn load_model_dir(dir: &Path) -> Result<Arc<dyn Model>, ArtifactError> {
    let desc = read_descriptor(dir)?;
    if let Some(linear) = &desc.flavors.linear {
        let model = LinearModel::from_path(&dir.join(&linear.model_file))
            .map_err(|e| ArtifactError::Flavor { flavor: "linear", reason: format!("{e:#}") })?;
        return Ok(Arc::new(model));
    }
    if let Some(onnx) = &desc.flavors.onnx {
        return load_onnx(dir, onnx);
    }
    Err(ArtifactError::UnsupportedFlavor(desc.flavors.names()))
}

#[cfg(feature = "onnx")]
fn load_onnx(dir: &Path, flavor: &OnnxFlavor) -> Result<Arc<dyn Model>, ArtifactError> {
    let model = crate::onnx::OnnxModel::load(&dir.join(&flavor.data), flavor.input_dim)
        .map_err(|e| ArtifactError::Flavor { flavor: "onnx", reason: format!("{e:#}") })?;
    Ok(Arc::new(model))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(_dir: &Path, _flavor: &OnnxFlavor) -> Result<Arc<dyn Model>, ArtifactError> {
    Err(ArtifactError::Flavor { flavor: "onnx", reason: "built without the `onnx` feature".into() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeatureMatrix;
    use serde_json::json;

    fn write(dir: &Path, name: &str, body: &str) { std::fs::write(dir.join(name), body).unwrap(); }

    #[test]
    fn cache_path_is_deterministic() {
        let p = cache_path(Path::new("/cache"), "churn", "production");
        assert_eq!(p, PathBuf::from("/cache/churn/production"));
    }

    #[test]
    fn component_validation() {
        assert!(validate_component("churn-model_v2").is_ok());
        assert!(validate_component("3").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b"] { assert!(validate_component(bad).is_err(), "{bad}"); }
    }

    #[test]
    fn loads_linear_flavor() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_marker(dir.path()));
        write(dir.path(), "model.json", r#"{"coefficients": [[1.0, 2.0]], "intercepts": [0.5]}"#);
        write(dir.path(), MARKER_FILE, "artifact_path: model\nrun_id: abc123\nflavors:\n  python_function: {loader_module: x}\n  linear:\n    model_file: model.json\n");
        assert!(has_marker(dir.path()));
        let desc = read_descriptor(dir.path()).unwrap();
        assert_eq!(desc.run_id.as_deref(), Some("abc123"));
        let model = load_model_dir(dir.path()).unwrap();
        assert_eq!(model.flavor(), "linear");
        let out = model.predict(&FeatureMatrix::from_rows(vec![vec![1.0, 1.0]]).unwrap()).unwrap();
        assert_eq!(out, vec![json!(3.5)]);
    }

    #[test]
    fn unsupported_flavor_lists_what_was_found() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), MARKER_FILE, "flavors:\n  sklearn: {pickled_model: model.pkl}\n");
        let err = load_model_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ArtifactError::UnsupportedFlavor(ref s) if s.contains("sklearn")));
    }

    #[test]
    fn broken_model_file_is_a_flavor_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "model.json", "{not json");
        write(dir.path(), MARKER_FILE, "flavors:\n  linear: {}\n");
        assert!(matches!(load_model_dir(dir.path()).unwrap_err(), ArtifactError::Flavor { flavor: "linear", .. }));
    }
}
