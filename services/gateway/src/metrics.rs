//! Prometheus recorder and request-level metric helpers

use std::time::Duration;

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Install the global Prometheus recorder; the handle renders `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("invalid duration buckets")?
        .set_buckets_for_metric(
            Matcher::Full("retrieval_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("invalid retrieval buckets")?
        .set_buckets_for_metric(
            Matcher::Full("retrieval_first_byte_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("invalid first-byte buckets")?
        .install_recorder()
        .context("failed to install metrics recorder")
}

/// Record the terminal outcome of one gateway request.
pub fn record_request(error_type: Option<&'static str>, duration: Duration) {
    let status = error_type.unwrap_or("ok");
    metrics::counter!("gateway_requests_total", "status" => status).increment(1);
    metrics::histogram!("gateway_request_duration_seconds").record(duration.as_secs_f64());
}
