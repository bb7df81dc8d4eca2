//! HTTP surface for health checks and Prometheus metrics.
//!
//! - `/health` - always 200 while the process runs
//! - `/ready` - 200 once the consumer reports itself running
//! - `/metrics` - Prometheus exposition format

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

type ReadyCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Handler for Prometheus metrics endpoint
async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type())],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn ready_handler(State(ready): State<ReadyCheck>) -> Response {
    if ready() {
        "READY".into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

/// Create the exporter router.
pub fn create_router(ready: ReadyCheck) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(ready)
}

/// Bind and serve the exporter until the process exits.
pub async fn serve(addr: SocketAddr, ready: ReadyCheck) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Metrics exporter listening");
    axum::serve(listener, create_router(ready)).await
}
