//! Prometheus metrics endpoint.

use super::HttpState;
use crate::metrics::SyncMetrics;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::fmt::Write;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format, labelled with the input id.
pub async fn metrics_handler(Extension(state): Extension<Arc<HttpState>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&state.input_id, &state.metrics),
    )
}

/// Render every metric of one input.
pub(crate) fn render(input: &str, m: &SyncMetrics) -> String {
    let series = [
        ("sync_total", "counter", "Full synchronizations started", &m.sync_total),
        ("sync_errors_total", "counter", "Full synchronizations failed", &m.sync_errors),
        ("update_total", "counter", "Incremental updates started", &m.update_total),
        ("update_errors_total", "counter", "Incremental updates failed", &m.update_errors),
        ("panics_recovered_total", "counter", "Cycle panics recovered", &m.panics_recovered),
        ("events_published_total", "counter", "Events handed to the pipeline", &m.events_published),
        ("events_acked_total", "counter", "Events acknowledged by the pipeline", &m.events_acked),
        ("assets_changed_total", "counter", "Assets discovered, modified or deleted", &m.assets_changed),
        ("last_cycle_milliseconds", "gauge", "Duration of the most recent cycle", &m.last_cycle_millis),
        ("last_sync_timestamp_seconds", "gauge", "Unix time of the last committed full sync", &m.last_sync_timestamp),
        ("last_update_timestamp_seconds", "gauge", "Unix time of the last committed update", &m.last_update_timestamp),
    ];

    let mut body = format!(
        "# HELP idsync_info Build information\n# TYPE idsync_info gauge\nidsync_info{{version=\"{}\"}} 1\n",
        env!("CARGO_PKG_VERSION")
    );
    for (name, kind, help, value) in series {
        let _ = write!(
            body,
            "\n# HELP idsync_{name} {help}\n# TYPE idsync_{name} {kind}\nidsync_{name}{{input=\"{input}\"}} {}\n",
            SyncMetrics::get(value)
        );
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn prometheus_format_is_valid() {
        let m = SyncMetrics::default();
        m.update_errors.fetch_add(2, Ordering::Relaxed);
        let body = render("ea-1", &m);

        assert!(body.contains("# TYPE idsync_update_errors_total counter"));
        assert!(body.contains("idsync_update_errors_total{input=\"ea-1\"} 2"));
        assert!(body.contains("# TYPE idsync_last_cycle_milliseconds gauge"));
        for line in body.lines().filter(|l| !l.is_empty() && !l.starts_with('#')) {
            let (_, value) = line.rsplit_once(' ').unwrap();
            value.parse::<u64>().unwrap();
        }
    }
}
