//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Poll queries total (counter).
pub const POLL_QUERIES_TOTAL: &str = "poll_queries_total";
/// Watch queries total (counter).
pub const WATCH_QUERIES_TOTAL: &str = "watch_queries_total";
/// Watch sessions currently open (gauge).
pub const WATCH_ACTIVE: &str = "watch_active";
/// Watch sessions killed by a newer duplicate (counter).
pub const WATCH_SUPERSEDED_TOTAL: &str = "watch_superseded_total";
/// Watch sessions that delivered a terminal payload (counter).
pub const WATCH_DELIVERED_TOTAL: &str = "watch_delivered_total";
