//! `/metrics` scrape endpoint
//!
//! Stateless, so it is merged after the federation routes receive their
//! state and sits outside their compression, trace and CORS layers.

use axum::{Router, http::header::CONTENT_TYPE, response::IntoResponse, routing::get};
use prometheus::{Encoder, TEXT_FORMAT, TextEncoder};

use crate::error::AppError;
use crate::metrics::REGISTRY;

/// Render the registry in the Prometheus text exposition format
async fn scrape() -> Result<impl IntoResponse, AppError> {
    let families = REGISTRY.gather();
    let body = TextEncoder::new()
        .encode_to_string(&families)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode metrics: {e}")))?;

    Ok(([(CONTENT_TYPE, TEXT_FORMAT)], body))
}

pub fn metrics_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(scrape))
}
