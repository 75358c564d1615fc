//! `/metrics` endpoint in the Prometheus text format, for the embedding
//! binary to serve.

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

/// Encode everything in [`REGISTRY`]
pub async fn metrics_handler() -> Result<impl IntoResponse, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let body = encoder.encode_to_string(&REGISTRY.gather()).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
    })?;

    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], body))
}

/// Router exposing `GET /metrics`.
///
/// Nothing in the workspace serves HTTP; the binary embedding the queues
/// merges this into its own router.
pub fn create_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}
