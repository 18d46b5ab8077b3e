//! Prometheus metrics export
//!
//! Counters are recorded unconditionally; they are no-ops until
//! [`init_metrics`] installs the Prometheus recorder (the dispatcher does,
//! the CLI does not).

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::models::{ObjectKind, TrustVerdict, VerificationOutcome};
use crate::AppState;

/// Prometheus metrics recorder
static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder
pub fn init_metrics() -> Result<()> {
    METRICS_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("keygate_check_duration_seconds".to_string()),
                &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
            )
            .context("Invalid histogram buckets")?
            .install_recorder()
            .context("Failed to install Prometheus recorder")
    })?;
    Ok(())
}

/// Record the outcome of verifying one object
pub fn record_object_check(kind: ObjectKind, outcome: &VerificationOutcome) {
    let result = match (outcome.is_verified(), outcome.any_signature_present()) {
        (true, _) => "verified",
        (false, true) => "unverified",
        (false, false) => "unsigned",
    };
    counter!("keygate_object_checks_total", "kind" => kind.as_str(), "result" => result).increment(1);
}

/// Record an object that could not be parsed
pub fn record_malformed_object(kind: ObjectKind) {
    counter!("keygate_object_checks_total", "kind" => kind.as_str(), "result" => "malformed").increment(1);
}

/// Record a key download attempt
pub fn record_key_download(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!("keygate_key_downloads_total", "result" => result).increment(1);
}

/// Record tags fetched from a pull request's source repository
pub fn record_fork_tags(count: usize) {
    counter!("keygate_fork_tags_fetched_total").increment(count as u64);
}

/// Record a finished trust search
pub fn record_search(verdict: &TrustVerdict) {
    counter!("keygate_searches_total", "verdict" => verdict.as_str()).increment(1);
}

/// Record a dispatched pull request check
pub fn record_check(state: &str, duration_secs: f64) {
    counter!("keygate_checks_total", "state" => state.to_string()).increment(1);
    histogram!("keygate_check_duration_seconds").record(duration_secs);
}

/// Prometheus metrics endpoint handler
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    gauge!("keygate_queued_checks").set(state.queue.queued() as f64);

    let metrics = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics,
    )
}
