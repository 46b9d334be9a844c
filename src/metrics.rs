//! Metrics for the outgoing S2S engine.
//!
//! Uses the global OpenTelemetry meter provider, which must be initialized
//! by the host application.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("xmpp-s2s"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for `authenticate_domain` outcomes, labeled by path (`policy`,
/// `reuse`, `handshake`) and result.
pub fn auth_attempts() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.s2s.auth.attempts")
        .with_description("Total outgoing S2S authentication attempts")
        .with_unit("attempt")
        .build()
}

/// Counter for S2S connection attempts (socket + TLS + negotiation, one
/// per handshake invocation).
pub fn s2s_connection_attempts() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.s2s.connection.attempts")
        .with_description("Total S2S connection attempts")
        .with_unit("connection")
        .build()
}

/// Counter for S2S TLS handshakes completed.
pub fn s2s_tls_handshakes() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.s2s.tls.established")
        .with_description("Total S2S TLS handshakes completed")
        .with_unit("handshake")
        .build()
}

/// Counter for piggyback (session reuse) authentications.
pub fn piggyback_authentications() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.s2s.piggyback.authentications")
        .with_description("Total domain pairs authorized via piggyback dialback")
        .with_unit("pair")
        .build()
}

/// Counter for bounces generated by the send path.
pub fn bounces_generated() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.s2s.bounces")
        .with_description("Total bounce stanzas generated for unauthorized destinations")
        .with_unit("stanza")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for active outgoing S2S connections.
pub fn s2s_connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.s2s.connections.active")
        .with_description("Current number of active outgoing S2S connections")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record an authentication attempt outcome on a given path.
pub fn record_auth_attempt(path: &str, success: bool) {
    auth_attempts().add(
        1,
        &[
            KeyValue::new("path", path.to_string()),
            KeyValue::new("result", if success { "success" } else { "failure" }),
        ],
    );
}

/// Record an S2S connection attempt.
pub fn record_s2s_connection_attempt() {
    s2s_connection_attempts().add(1, &[]);
}

/// Record S2S connection count change.
pub fn record_s2s_connection_count(count: i64) {
    s2s_connections_active().record(count, &[]);
}

/// Record S2S TLS handshake completion.
pub fn record_s2s_tls_established() {
    s2s_tls_handshakes().add(1, &[]);
}

/// Record a successful piggyback authentication.
pub fn record_piggyback_authentication() {
    piggyback_authentications().add(1, &[]);
}

/// Record a bounce being generated, labeled by stanza kind.
pub fn record_bounce(stanza_type: &str) {
    bounces_generated().add(1, &[KeyValue::new("type", stanza_type.to_string())]);
}
