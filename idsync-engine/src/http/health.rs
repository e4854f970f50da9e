//! Health check endpoint.

use super::HttpState;
use crate::metrics::SyncMetrics;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Crate version.
    pub version: String,
    /// Input id.
    pub input: String,
    /// Unix time of the last committed full synchronization, 0 if none.
    pub last_sync: u64,
    /// Unix time of the last committed incremental update, 0 if none.
    pub last_update: u64,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(state): Extension<Arc<HttpState>>) -> Json<HealthStatus> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        input: state.input_id.clone(),
        last_sync: SyncMetrics::get(&state.metrics.last_sync_timestamp),
        last_update: SyncMetrics::get(&state.metrics.last_update_timestamp),
        uptime_seconds: uptime,
    })
}
