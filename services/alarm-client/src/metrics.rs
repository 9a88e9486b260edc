//! Prometheus metrics exposition
//!
//! - `auth_logins_started_total` (counter)
//! - `auth_callbacks_total` (counter): label `outcome`
//! - `backend_requests_total` (counter): labels `endpoint`, `outcome`
//! - `backend_request_duration_seconds` (histogram): label `endpoint`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("backend_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering
/// `/metrics`. The duration metric gets explicit buckets so it renders as a
/// histogram rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

pub fn record_login_started() {
    metrics::counter!("auth_logins_started_total").increment(1);
}

/// Record how a callback load ended (`established`, `stalled`, `failed`, ...).
pub fn record_callback(outcome: &'static str) {
    metrics::counter!("auth_callbacks_total", "outcome" => outcome).increment(1);
}

/// Record a completed backend call.
pub fn record_backend_request(endpoint: &'static str, outcome: &'static str, duration_secs: f64) {
    metrics::counter!("backend_requests_total", "endpoint" => endpoint, "outcome" => outcome)
        .increment(1);
    metrics::histogram!("backend_request_duration_seconds", "endpoint" => endpoint)
        .record(duration_secs);
}
