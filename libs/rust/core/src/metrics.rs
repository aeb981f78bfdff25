//! Prometheus exposition for a service-owned registry.

use anyhow::Result;
use axum::{extract::State, http::{header, StatusCode}, response::{IntoResponse, Response}, routing::get, Router};
use prometheus::{Encoder, Registry, TextEncoder};

/// Encode every family gathered from `registry` in the text exposition format.
pub fn render_metrics(registry: &Registry) -> Result<Vec<u8>> {
    let metric_families = registry.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf)?;
    Ok(buf)
}

/// `GET /metrics` over the given registry.
pub fn metrics_router(registry: Registry) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(registry)
}

async fn metrics_handler(State(registry): State<Registry>) -> Response {
    match render_metrics(&registry) {
        Ok(buf) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}
