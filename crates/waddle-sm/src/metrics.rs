//! Session manager metrics.
//!
//! Uses the global OpenTelemetry meter provider which must be initialized
//! by the host application. Without one, recording is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-sm"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for packets entering the router.
pub fn packets_processed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.sm.packets.processed")
        .with_description("Total packets received by the session manager")
        .with_unit("packet")
        .build()
}

/// Counter for error stanzas synthesized by the router.
pub fn errors_synthesized() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.sm.errors.synthesized")
        .with_description("Total error responses synthesized for unprocessed packets")
        .with_unit("packet")
        .build()
}

/// Counter for packets a processor could not take because its queue was full.
pub fn queue_skips() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.sm.queue.skips")
        .with_description("Total packets skipped because a worker queue was full")
        .with_unit("packet")
        .build()
}

/// Counter for connections closed by the authentication timer.
pub fn auth_timeouts() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.sm.auth.timeouts")
        .with_description("Total connections closed before authenticating")
        .with_unit("connection")
        .build()
}

/// Counter for finalized connections.
pub fn connections_closed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.sm.connections.closed")
        .with_description("Total connections finalized")
        .with_unit("connection")
        .build()
}

/// Counter for connections removed by the stale connection reaper.
pub fn stale_removed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.sm.stale.removed")
        .with_description("Total stale connections removed by the reaper")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for open user sessions.
pub fn sessions_open() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.sm.sessions.open")
        .with_description("Current number of user sessions")
        .with_unit("session")
        .build()
}

// ============================================================================
// Histograms (Latency)
// ============================================================================

/// Histogram for plugin processing latency.
pub fn processing_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("xmpp.sm.processing.duration")
        .with_description("Time a processor spent on one packet")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a packet entering the router.
pub fn record_packet(kind: &str) {
    packets_processed().add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record a synthesized error response.
pub fn record_error_synthesized(condition: &str) {
    errors_synthesized().add(1, &[KeyValue::new("condition", condition.to_string())]);
}

/// Record a queue overflow for a plugin.
pub fn record_queue_skip(plugin: &str) {
    queue_skips().add(1, &[KeyValue::new("plugin", plugin.to_string())]);
}

/// Record an authentication timeout.
pub fn record_auth_timeout() {
    auth_timeouts().add(1, &[]);
}

/// Record a finalized connection.
pub fn record_connection_closed() {
    connections_closed().add(1, &[]);
}

/// Record connections removed by one reaper sweep.
pub fn record_stale_removed(count: u64) {
    stale_removed().add(count, &[]);
}

/// Update the open sessions gauge.
pub fn record_session_count(count: i64) {
    sessions_open().record(count, &[]);
}

/// Record processing latency of one packet in milliseconds.
pub fn record_processing_duration(latency_ms: f64, plugin: &str) {
    processing_duration().record(latency_ms, &[KeyValue::new("plugin", plugin.to_string())]);
}
