//! Metric recording functions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rv_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Every label takes a `&'static str` from a closed set (reason enums, event
//! kinds, error labels). No id or username ever becomes a label.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle that renders
/// `/metrics`.
///
/// Must be called before any metric is recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Calls last seconds to an hour
        .set_buckets_for_metric(
            Matcher::Prefix("rv_call_duration".to_string()),
            &[
                5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
            ],
        )
        .map_err(|e| format!("Failed to set call duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `rv_connections_active`
pub fn set_connections_active(count: usize) {
    // usize to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("rv_connections_active").set(count as f64);
}

/// Metric: `rv_queue_depth`
pub fn set_queue_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rv_queue_depth").set(depth as f64);
}

// ============================================================================
// Matching
// ============================================================================

/// Metric: `rv_matches_total`
/// Labels: `result` (matched, rejected, aborted, error)
pub fn record_match_attempt(result: &'static str) {
    counter!("rv_matches_total", "result" => result).increment(1);
}

/// Metric: `rv_matching_head_blocked_total`
/// Labels: `reason` (mode_mismatch, self_match, banned, gender_preference,
/// already_in_room)
///
/// Each increment is one attempt that stopped on an incompatible head pair.
pub fn record_head_blocked(reason: &'static str) {
    counter!("rv_matching_head_blocked_total", "reason" => reason).increment(1);
}

// ============================================================================
// Rooms & negotiation
// ============================================================================

/// Metric: `rv_rooms_ended_total`
/// Labels: `reason` (bounded by `RoomEndReason`)
pub fn record_room_ended(reason: &'static str) {
    counter!("rv_rooms_ended_total", "reason" => reason).increment(1);
}

/// Metric: `rv_negotiations_total`
/// Labels: `outcome` (kept, declined, timeout, abandoned, torn_down)
pub fn record_negotiation(outcome: &'static str) {
    counter!("rv_negotiations_total", "outcome" => outcome).increment(1);
}

// ============================================================================
// Calls
// ============================================================================

/// Metric: `rv_calls_total`
/// Labels: `outcome` (rejected, or a `CallEndReason`)
pub fn record_call_outcome(outcome: &'static str) {
    counter!("rv_calls_total", "outcome" => outcome).increment(1);
}

/// Metric: `rv_call_duration_seconds`
pub fn record_call_duration(duration: Duration) {
    histogram!("rv_call_duration_seconds").record(duration.as_secs_f64());
}

/// Metric: `rv_signal_relay_total`
/// Labels: `kind` (offer, answer, candidate), `result` (delivered, failed)
pub fn record_signal_relay(kind: &'static str, delivered: bool) {
    let result = if delivered { "delivered" } else { "failed" };
    counter!("rv_signal_relay_total", "kind" => kind, "result" => result).increment(1);
}

// ============================================================================
// Errors
// ============================================================================

/// Metric: `rv_errors_total`
/// Labels: `error_type` (from `SessionError::error_type_label`)
pub fn record_error(error_type: &'static str) {
    counter!("rv_errors_total", "error_type" => error_type).increment(1);
}
