//! Metric names and the Prometheus exporter.
//!
//! Recording goes through the `metrics` facade macros at the call sites;
//! this module owns the metric names, their descriptions, and the exporter
//! handle the API server renders on `GET /metrics`.

use crate::error::Result;

use anyhow::Context as _;
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Enqueue requests by type/queue/status (ok|error).
pub const ENQUEUE_TOTAL: &str = "dq_enqueue_total";
/// Enqueue handler latency.
pub const ENQUEUE_LATENCY: &str = "dq_enqueue_latency_seconds";
/// Worker deliveries by queue and outcome.
pub const WORKER_PROCESSED_TOTAL: &str = "dq_worker_processed_total";
/// Per-delivery handling latency.
pub const WORKER_HANDLE_LATENCY: &str = "dq_worker_handle_latency_seconds";

/// Install the global Prometheus recorder and describe every metric the
/// daemon records. Returns the handle used to render the text exposition.
pub fn install() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    describe_counter!(
        ENQUEUE_TOTAL,
        "Total enqueue requests by type/queue/status (ok|error)."
    );
    describe_histogram!(ENQUEUE_LATENCY, Unit::Seconds, "Enqueue handler latency.");
    describe_counter!(
        WORKER_PROCESSED_TOTAL,
        "Deliveries processed by queue and outcome."
    );
    describe_histogram!(
        WORKER_HANDLE_LATENCY,
        Unit::Seconds,
        "Per-delivery handling latency."
    );

    Ok(handle)
}

/// Metric labels must never be empty strings.
pub fn label_or_unknown(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::label_or_unknown;

    #[test]
    fn empty_labels_become_unknown() {
        assert_eq!(label_or_unknown(""), "unknown");
        assert_eq!(label_or_unknown("  "), "unknown");
        assert_eq!(label_or_unknown("email.send.v1"), "email.send.v1");
    }
}
