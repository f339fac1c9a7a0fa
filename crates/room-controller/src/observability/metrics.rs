//! Metrics definitions for the Room Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rc_` prefix for Room Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 4 values (registry, room, connection, worker)
//! - `method`: bounded by the signaling method set (~12 values)
//! - `status`: `ok` or an error code (~12 values)
//! - `outcome`: admission outcomes (~6 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling requests include worker round trips; p99 target < 250ms
        .set_buckets_for_metric(
            Matcher::Prefix("rc_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("rc_directory".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set directory latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `rc_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_rooms_active").set(count as f64);
}

/// Metric: `rc_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_peers_active").set(count as f64);
}

/// Metric: `rc_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_connections_active").set(count as f64);
}

/// Metric: `rc_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record one signaling request and its latency.
///
/// Metrics: `rc_signaling_requests_total{method,status}`,
/// `rc_signaling_request_duration_seconds{method}`
pub fn record_signaling_request(method: &'static str, status: &'static str, duration: Duration) {
    counter!("rc_signaling_requests_total", "method" => method, "status" => status).increment(1);
    histogram!("rc_signaling_request_duration_seconds", "method" => method)
        .record(duration.as_secs_f64());
}

/// Metric: `rc_admission_total`
/// Labels: `outcome` (admitted, not_enrolled, session_not_started, not_found, room_full, error)
pub fn record_admission(outcome: &'static str) {
    counter!("rc_admission_total", "outcome" => outcome).increment(1);
}

/// Metric: `rc_events_dropped_total`
///
/// Server events dropped because a client's outbound queue was full.
pub fn record_event_dropped() {
    counter!("rc_events_dropped_total").increment(1);
}

// ============================================================================
// Collaborators
// ============================================================================

/// Metric: `rc_directory_query_duration_seconds{operation,status}`
pub fn record_directory_query(operation: &'static str, status: &'static str, duration: Duration) {
    histogram!(
        "rc_directory_query_duration_seconds",
        "operation" => operation,
        "status" => status
    )
    .record(duration.as_secs_f64());
}

// ============================================================================
// Failures
// ============================================================================

/// Metric: `rc_worker_deaths_total`
pub fn record_worker_death() {
    counter!("rc_worker_deaths_total").increment(1);
}

/// Metric: `rc_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("rc_actor_panics_total", "actor_type" => actor_type).increment(1);
}

/// Metric: `rc_teardown_failures_total`
/// Labels: `resource`
///
/// A close call that failed while releasing a peer's resources.
pub fn record_teardown_failure(resource: &'static str) {
    counter!("rc_teardown_failures_total", "resource" => resource).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_gauges_without_recorder() {
        // No recorder installed: calls are no-ops and must not panic
        set_rooms_active(0);
        set_peers_active(3);
        set_connections_active(10);
        set_actor_mailbox_depth("room", 5);
    }

    #[test]
    fn test_signaling_request_emits_counter_and_histogram() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_signaling_request("produce", "ok", Duration::from_millis(12));
            record_signaling_request("produce", "negotiation_failed", Duration::from_millis(3));
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let requests: u64 = snapshot
            .iter()
            .filter(|(key, _, _, _)| key.key().name() == "rc_signaling_requests_total")
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(n) => *n,
                _ => 0,
            })
            .sum();
        assert_eq!(requests, 2);

        let has_histogram = snapshot
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "rc_signaling_request_duration_seconds");
        assert!(has_histogram);
    }

    #[test]
    fn test_worker_death_counter() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_worker_death();
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let deaths = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "rc_worker_deaths_total")
            .map(|(_, _, _, value)| value);
        assert_eq!(deaths, Some(&DebugValue::Counter(1)));
    }
}
