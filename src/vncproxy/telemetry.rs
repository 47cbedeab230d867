use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

pub fn session_opened() {
    metrics::counter!("vncproxy_sessions_total").increment(1);
    metrics::gauge!("vncproxy_active_sessions").increment(1.0);
}

pub fn session_closed() {
    metrics::gauge!("vncproxy_active_sessions").decrement(1.0);
}

pub fn resolve_failed() {
    metrics::counter!("vncproxy_resolve_failures_total").increment(1);
}

pub fn dial_failed() {
    metrics::counter!("vncproxy_dial_failures_total").increment(1);
}

pub fn relayed(from_client: u64, from_backend: u64) {
    metrics::counter!("vncproxy_bytes_from_client_total").increment(from_client);
    metrics::counter!("vncproxy_bytes_from_backend_total").increment(from_backend);
}
