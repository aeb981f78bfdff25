//! HTTP surface: `/predict`, `/health`, `/model-info` under the API prefix,
//! plus `/metrics` at the root.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::manager::{ModelInfo, ModelManager, PredictError, Prediction};
use crate::metrics::ServingMetrics;

#[derive(Debug, Clone)]
pub struct AppState {
    pub manager: ModelManager,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionInput {
    pub features: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
}

/// Error body is always `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self { Self { status, detail: detail.into() } }
    fn not_loaded(status: StatusCode) -> Self { Self::new(status, "Model not loaded") }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<PredictError> for ApiError {
    fn from(e: PredictError) -> Self {
        match e {
            PredictError::NotLoaded => Self::not_loaded(StatusCode::SERVICE_UNAVAILABLE),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(r: JsonRejection) -> Self { Self::new(r.status(), r.body_text()) }
}

/// `None` means mount at the root.
fn normalize_prefix(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() { None } else { Some(format!("/{trimmed}")) }
}

pub fn router(state: AppState, metrics: &ServingMetrics, prefix: &str) -> Router {
    let api = Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .route("/model-info", get(model_info))
        .with_state(state);
    let app = match normalize_prefix(prefix) {
        Some(p) => Router::new().nest(&p, api),
        None => api,
    };
    app.merge(serving_core::metrics_router(metrics.registry().clone()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn predict(
    State(state): State<AppState>,
    payload: Result<Json<PredictionInput>, JsonRejection>,
) -> Result<Json<Prediction>, ApiError> {
    let Json(input) = payload?;
    if !state.manager.is_loaded() {
        return Err(ApiError::not_loaded(StatusCode::SERVICE_UNAVAILABLE));
    }
    let manager = state.manager.clone();
    let result = tokio::task::spawn_blocking(move || manager.predict(&input.features))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("prediction task failed: {e}")))?;
    Ok(Json(result?))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy".into(), model_loaded: state.manager.is_loaded() })
}

async fn model_info(State(state): State<AppState>) -> Result<Json<ModelInfo>, ApiError> {
    state.manager.model_info().map(Json).ok_or_else(|| ApiError::not_loaded(StatusCode::NOT_FOUND))
}
