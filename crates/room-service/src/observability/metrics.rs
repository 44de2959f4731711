//! Metrics definitions for the room coordinator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rc_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (registry, room, connection)
//! - `message_type`: 5 client tags
//! - `status`: 2 values (playing, closed)
//! - `operation`: 3 store operations (save, load, remove)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Bucket layout shared by all latency histograms.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
];

/// Build a Prometheus recorder with the coordinator's histogram buckets.
///
/// # Errors
///
/// Returns error if a bucket set is rejected.
pub fn prometheus_builder() -> Result<PrometheusBuilder, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Prefix("rc_store".to_string()), LATENCY_BUCKETS)
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))
}

/// Initialize the global Prometheus recorder and return the handle used by
/// the `/metrics` route.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    prometheus_builder()?
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

/// Metric: `rc_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_connections_active").set(count as f64);
}

// ============================================================================
// Room lifecycle (Counters)
// ============================================================================

/// Metric: `rc_rooms_created_total`
pub fn record_room_created() {
    counter!("rc_rooms_created_total").increment(1);
}

/// Record a room status transition.
///
/// Metric: `rc_room_transitions_total`
/// Labels: `to` (playing, closed)
pub fn record_room_transition(to: &'static str) {
    counter!("rc_room_transitions_total", "to" => to).increment(1);
}

/// Metric: `rc_host_migrations_total`
pub fn record_host_migration() {
    counter!("rc_host_migrations_total").increment(1);
}

/// Participants removed because their outbound queue was full or closed.
///
/// Metric: `rc_participants_evicted_total`
///
/// A sustained non-zero rate means clients cannot keep up with fan-out.
pub fn record_participant_evicted() {
    counter!("rc_participants_evicted_total").increment(1);
}

// ============================================================================
// Protocol (Counters)
// ============================================================================

/// Metric: `rc_messages_received_total`
/// Labels: `message_type`
pub fn record_message_received(message_type: &'static str) {
    counter!("rc_messages_received_total", "message_type" => message_type).increment(1);
}

/// Metric: `rc_malformed_messages_total`
pub fn record_malformed_message() {
    counter!("rc_malformed_messages_total").increment(1);
}

// ============================================================================
// Actors (Counters)
// ============================================================================

/// Metric: `rc_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("rc_actor_panics_total", "actor_type" => actor_type).increment(1);
}

/// Metric: `rc_messages_dropped_total`
/// Labels: `actor_type`
pub fn record_message_dropped(actor_type: &'static str) {
    counter!("rc_messages_dropped_total", "actor_type" => actor_type).increment(1);
}

// ============================================================================
// Metadata store
// ============================================================================

/// Metric: `rc_store_latency_seconds`
/// Labels: `operation`
pub fn record_store_latency(operation: &'static str, duration: Duration) {
    histogram!("rc_store_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Metric: `rc_store_errors_total`
/// Labels: `operation`
pub fn record_store_error(operation: &'static str) {
    counter!("rc_store_errors_total", "operation" => operation).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_metrics_are_recorded_under_expected_names() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_rooms_active(3);
            set_connections_active(7);
            record_room_created();
            record_room_transition("playing");
            record_host_migration();
            record_participant_evicted();
            record_message_received("update");
            record_malformed_message();
            record_actor_panic("room");
            record_message_dropped("connection");
            record_store_latency("save", Duration::from_millis(2));
            record_store_error("save");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let names: Vec<String> = snapshot
            .iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "rc_rooms_active",
            "rc_connections_active",
            "rc_rooms_created_total",
            "rc_room_transitions_total",
            "rc_host_migrations_total",
            "rc_participants_evicted_total",
            "rc_messages_received_total",
            "rc_malformed_messages_total",
            "rc_actor_panics_total",
            "rc_messages_dropped_total",
            "rc_store_latency_seconds",
            "rc_store_errors_total",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing metric {expected}, got {names:?}"
            );
        }

        let rooms_active = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "rc_rooms_active")
            .map(|(_, _, _, value)| value.clone());
        assert!(matches!(rooms_active, Some(DebugValue::Gauge(v)) if v.into_inner() == 3.0));
    }

    #[test]
    fn test_prometheus_builder_accepts_buckets() {
        assert!(prometheus_builder().is_ok());
    }
}
