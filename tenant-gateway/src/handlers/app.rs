use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::error::GatewayError;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "tenant-gateway",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Prometheus scrape endpoint for the gateway's own metrics.
pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        crate::services::get_metrics(),
    )
}

pub async fn not_found() -> GatewayError {
    GatewayError::NotFound
}
