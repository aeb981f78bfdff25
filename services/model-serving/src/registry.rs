//! Model registry client.
//!
//! `ModelRegistry` resolves a (name, version-or-alias) pair to a concrete
//! version and downloads its artifact tree into a local directory.
//! `MlflowRegistry` implements it over the MLflow REST API.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::artifact::{validate_component, MARKER_FILE};
use crate::config::Settings;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry returned {status} {code}: {message}")]
    Api { status: u16, code: String, message: String },
    #[error("invalid tracking uri {0:?}")]
    InvalidBaseUrl(String),
    #[error("unsupported artifact uri {0:?}")]
    UnsupportedArtifactUri(String),
    #[error("artifact at {0:?} contains no files")]
    EmptyArtifact(String),
    #[error("artifact at {0:?} has no MLmodel descriptor")]
    MissingMarker(String),
    #[error("failed to write {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("artifact listing has unsafe entry {0:?}")]
    UnsafeEntry(String),
    #[error("artifact copy task failed: {0}")]
    Task(String),
}

/// A registered model version as returned by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// `version_alias` is either a numeric version or an alias such as `champion`.
    async fn resolve(&self, name: &str, version_alias: &str) -> Result<ModelVersion, RegistryError>;

    /// Download the full artifact tree into `dst`, which exists and is empty.
    /// Implementations write the `MLmodel` marker last.
    async fn download(&self, version: &ModelVersion, dst: &Path) -> Result<(), RegistryError>;
}

/// `models:/{name}@{version_alias}`
pub fn model_uri(name: &str, version_alias: &str) -> String { format!("models:/{name}@{version_alias}") }

fn is_numeric_version(s: &str) -> bool { !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) }

#[derive(Debug, Clone, PartialEq, Eq)]
enum ArtifactLocation {
    /// Path relative to the artifact proxy root.
    Proxy(String),
    Local(PathBuf),
}

fn parse_artifact_uri(uri: &str) -> Result<ArtifactLocation, RegistryError> {
    if let Some(rest) = uri.strip_prefix("mlflow-artifacts:") {
        // drop an optional //authority, the tracking server proxies either way
        let rest = match rest.strip_prefix("//") {
            Some(with_authority) => with_authority.find('/').map(|i| &with_authority[i..]).unwrap_or(""),
            None => rest,
        };
        return Ok(ArtifactLocation::Proxy(rest.trim_matches('/').to_string()));
    }
    if let Some(rest) = uri.strip_prefix("file://").or_else(|| uri.strip_prefix("file:")) {
        return Ok(ArtifactLocation::Local(PathBuf::from(rest)));
    }
    if uri.starts_with('/') {
        return Ok(ArtifactLocation::Local(PathBuf::from(uri)));
    }
    Err(RegistryError::UnsupportedArtifactUri(uri.to_string()))
}

/// Put the root marker last so a partial tree never looks complete.
fn marker_last(mut files: Vec<String>) -> Vec<String> {
    files.sort_by_key(|f| f == MARKER_FILE);
    files
}

#[derive(Debug, Deserialize)]
struct ModelVersionEnvelope { model_version: ModelVersion }

#[derive(Debug, Deserialize)]
struct DownloadUri { artifact_uri: String }

#[derive(Debug, Deserialize)]
struct FileList { #[serde(default)] files: Vec<FileInfo> }

#[derive(Debug, Deserialize)]
struct FileInfo {
    path: String,
    #[serde(default)]
    is_dir: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Clone)]
enum Auth {
    None,
    Bearer(String),
    Basic(String, Option<String>),
}

// credentials stay out of logs
impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bearer(_) => f.write_str("Bearer(..)"),
            Self::Basic(user, _) => write!(f, "Basic({user}, ..)"),
        }
    }
}

/// MLflow tracking server client.
#[derive(Debug, Clone)]
pub struct MlflowRegistry {
    client: Client,
    base: Url,
    auth: Auth,
}

impl MlflowRegistry {
    pub fn new(settings: &Settings) -> Result<Self, RegistryError> {
        let base = Url::parse(&settings.mlflow_tracking_uri)
            .map_err(|_| RegistryError::InvalidBaseUrl(settings.mlflow_tracking_uri.clone()))?;
        if base.cannot_be_a_base() {
            return Err(RegistryError::InvalidBaseUrl(settings.mlflow_tracking_uri.clone()));
        }
        let client = Client::builder().timeout(settings.registry_timeout()).build()?;
        let auth = match (&settings.mlflow_tracking_token, &settings.mlflow_tracking_username) {
            (Some(token), _) if !token.is_empty() => Auth::Bearer(token.clone()),
            (_, Some(user)) if !user.is_empty() => Auth::Basic(user.clone(), settings.mlflow_tracking_password.clone()),
            _ => Auth::None,
        };
        Ok(Self { client, base, auth })
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, RegistryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RegistryError::InvalidBaseUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn api(&self, method: &str) -> Result<Url, RegistryError> {
        self.endpoint(["api", "2.0", "mlflow"].into_iter().chain(method.split('/')))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None => req,
            Auth::Bearer(token) => req.bearer_auth(token),
            Auth::Basic(user, pass) => req.basic_auth(user, pass.as_ref()),
        }
    }

    async fn send(&self, url: Url, query: &[(&str, &str)]) -> Result<reqwest::Response, RegistryError> {
        debug!(%url, "registry request");
        let resp = self.authed(self.client.get(url).query(query)).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(api_error(status, &body))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, query: &[(&str, &str)]) -> Result<T, RegistryError> {
        Ok(self.send(url, query).await?.json::<T>().await?)
    }

    /// Walk the proxied tree under `root`, returning file paths relative to it.
    async fn list_proxy_tree(&self, root: &str) -> Result<Vec<String>, RegistryError> {
        let list_url = self.endpoint(["api", "2.0", "mlflow-artifacts", "artifacts"])?;
        let mut files = Vec::new();
        let mut pending = vec![String::new()];
        while let Some(rel) = pending.pop() {
            let path = join_rel(root, &rel);
            let listing: FileList = self.get_json(list_url.clone(), &[("path", path.as_str())]).await?;
            for f in listing.files {
                let name = f.path.rsplit('/').next().unwrap_or(&f.path);
                validate_component(name).map_err(|_| RegistryError::UnsafeEntry(f.path.clone()))?;
                let child = join_rel(&rel, name);
                if f.is_dir { pending.push(child) } else { files.push(child) }
            }
        }
        Ok(files)
    }

    async fn download_proxy(&self, root: &str, dst: &Path) -> Result<(), RegistryError> {
        let files = self.list_proxy_tree(root).await?;
        if files.is_empty() {
            return Err(RegistryError::EmptyArtifact(root.to_string()));
        }
        if !files.iter().any(|f| f == MARKER_FILE) {
            return Err(RegistryError::MissingMarker(root.to_string()));
        }
        for rel in marker_last(files) {
            let remote = join_rel(root, &rel);
            let segments = remote.split('/').filter(|s| !s.is_empty());
            let url = self.endpoint(
                ["api", "2.0", "mlflow-artifacts", "artifacts"].into_iter().chain(segments),
            )?;
            let target = contained(dst, &rel)?;
            let bytes = self.send(url, &[]).await?.bytes().await?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| RegistryError::Io { path: parent.to_path_buf(), source })?;
            }
            tokio::fs::write(&target, &bytes)
                .await
                .map_err(|source| RegistryError::Io { path: target.clone(), source })?;
            debug!(file = %rel, size = bytes.len(), "artifact file downloaded");
        }
        Ok(())
    }
}

fn join_rel(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{a}/{b}"),
    }
}

/// `dst/rel`, provided `rel` only descends.
fn contained(dst: &Path, rel: &str) -> Result<PathBuf, RegistryError> {
    let rel_path = Path::new(rel);
    let descends = rel_path.components().all(|c| matches!(c, Component::Normal(_)));
    if rel.is_empty() || !descends {
        return Err(RegistryError::UnsafeEntry(rel.to_string()));
    }
    Ok(dst.join(rel_path))
}

fn api_error(status: StatusCode, body: &str) -> RegistryError {
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.message.is_empty() { body.trim().to_string() } else { parsed.message };
    RegistryError::Api { status: status.as_u16(), code: parsed.error_code, message }
}

/// Recursive copy of a local artifact directory, marker last. Blocking.
fn copy_local_tree(src: &Path, dst: &Path) -> Result<(), RegistryError> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| RegistryError::Io { path: src.to_path_buf(), source: e.into() })?;
        if !entry.file_type().is_file() { continue; }
        if let Ok(rel) = entry.path().strip_prefix(src) {
            files.push(rel.to_string_lossy().into_owned());
        }
    }
    if files.is_empty() {
        return Err(RegistryError::EmptyArtifact(src.display().to_string()));
    }
    if !files.iter().any(|f| f == MARKER_FILE) {
        return Err(RegistryError::MissingMarker(src.display().to_string()));
    }
    for rel in marker_last(files) {
        let target = dst.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| RegistryError::Io { path: parent.to_path_buf(), source })?;
        }
        std::fs::copy(src.join(&rel), &target)
            .map_err(|source| RegistryError::Io { path: target.clone(), source })?;
    }
    Ok(())
}

#[async_trait]
impl ModelRegistry for MlflowRegistry {
    async fn resolve(&self, name: &str, version_alias: &str) -> Result<ModelVersion, RegistryError> {
        let (method, key) = if is_numeric_version(version_alias) {
            ("model-versions/get", "version")
        } else {
            ("registered-models/alias", "alias")
        };
        let envelope: ModelVersionEnvelope =
            self.get_json(self.api(method)?, &[("name", name), (key, version_alias)]).await?;
        debug!(
            model_name = name,
            version_alias,
            version = %envelope.model_version.version,
            "resolved model version"
        );
        Ok(envelope.model_version)
    }

    async fn download(&self, version: &ModelVersion, dst: &Path) -> Result<(), RegistryError> {
        let DownloadUri { artifact_uri } = self
            .get_json(
                self.api("model-versions/get-download-uri")?,
                &[("name", version.name.as_str()), ("version", version.version.as_str())],
            )
            .await?;
        info!(model_name = %version.name, version = %version.version, %artifact_uri, "downloading model artifact");
        match parse_artifact_uri(&artifact_uri)? {
            ArtifactLocation::Proxy(root) => self.download_proxy(&root, dst).await,
            ArtifactLocation::Local(src) => {
                let dst = dst.to_path_buf();
                tokio::task::spawn_blocking(move || copy_local_tree(&src, &dst))
                    .await
                    .map_err(|e| RegistryError::Task(e.to_string()))?
            }
        }
    }
}
