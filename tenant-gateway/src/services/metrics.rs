//! Prometheus recorder for the `/metrics` endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Requests forwarded with the tenant matcher injected.
pub const TENANT_INJECTIONS_TOTAL: &str = "gateway_tenant_injections_total";
/// Requests forwarded unscoped, labelled by the policy that allowed it.
pub const BYPASS_TOTAL: &str = "gateway_bypass_total";
pub const UPSTREAM_ERRORS_TOTAL: &str = "gateway_upstream_errors_total";

/// Install the global recorder. Must run before anything records a metric.
pub fn init_metrics() -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;

    METRICS_HANDLE
        .set(handle)
        .map_err(|_| anyhow::anyhow!("metrics recorder already initialized"))
}

pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}
