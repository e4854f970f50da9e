//! HTTP endpoints for idsync.
//!
//! Provides health checks and Prometheus metrics.

pub mod health;
mod metrics;

use crate::metrics::SyncMetrics;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// State shared with the handlers.
#[derive(Debug)]
pub struct HttpState {
    /// Input id, reported in health and metric labels.
    pub input_id: String,
    /// Counters of the running input.
    pub metrics: Arc<SyncMetrics>,
}

/// Build the HTTP router with all endpoints.
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(Extension(state))
}
