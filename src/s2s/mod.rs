//! Outgoing Server-to-Server (S2S) session establishment.
//!
//! Given a `(local_domain, remote_domain)` pair, obtains a connection over
//! which the local server is authorized to send stanzas, coordinating:
//!
//! - a multi-step protocol handshake (TCP -> optional direct TLS -> stream
//!   open -> feature negotiation -> STARTTLS -> SASL EXTERNAL -> server
//!   dialback), with well-defined fallback paths;
//! - connection reuse across multiple domain pairs, including piggyback
//!   authentication of sub/superdomains onto an existing dialback session;
//! - a mutual-exclusion discipline per remote domain;
//! - certificate validation policy and precise error semantics.
//!
//! DNS/SRV resolution, TCP socket creation, the TLS stack itself, the XML
//! pull parser's transport, the routing table, and the dialback responder
//! (incoming) side are all external collaborators, consumed only through
//! the traits in [`transport`].

pub mod authenticator;
pub mod bounce;
pub mod dialback;
pub mod dns;
pub mod domain_pair;
pub mod handshake;
pub mod mutex_registry;
pub mod pool;
pub mod reuse;
pub mod session;
pub mod session_registry;
pub mod transport;

use std::sync::atomic::{AtomicI64, Ordering};

pub use dialback::{DialbackKey, DialbackResult, DialbackState, NS_DIALBACK, NS_DIALBACK_FEATURES};
pub use dns::{DnsError, ResolvedTarget, SrvResolver, DEFAULT_S2S_PORT};

/// Coarse-grained S2S connection state, used for metrics and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S2sState {
    /// Initial connection (before TLS)
    Initial,
    /// Dialback in progress
    Dialback,
    /// Authenticated and ready for stanza routing
    Established,
    /// Connection closed
    Closed,
}

/// S2S connection direction. This engine only ever produces `Outbound`
/// sessions; `Inbound` is recorded for sessions reported by the (external)
/// dialback responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S2sDirection {
    /// Inbound connection (remote server connected to us)
    Inbound,
    /// Outbound connection (we connected to remote server)
    Outbound,
}

/// Coarse-grained metrics tracking across all outgoing S2S connections.
#[derive(Debug)]
pub struct S2sMetrics {
    connection_attempts: AtomicI64,
    active_connections: AtomicI64,
    tls_established: AtomicI64,
    connections_established: AtomicI64,
}

impl S2sMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            connection_attempts: AtomicI64::new(0),
            active_connections: AtomicI64::new(0),
            tls_established: AtomicI64::new(0),
            connections_established: AtomicI64::new(0),
        }
    }

    /// Record an outgoing connection attempt.
    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_s2s_connection_attempt();
    }

    /// Record a connection reaching established (authenticated) state.
    pub fn record_connection_established(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_s2s_connection_count(self.active_connections());
    }

    /// Record a connection being closed.
    pub fn record_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::record_s2s_connection_count(self.active_connections());
    }

    /// Record TLS being established.
    pub fn record_tls_established(&self) {
        self.tls_established.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_s2s_tls_established();
    }

    /// Current number of active connections.
    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Total connection attempts observed.
    pub fn total_connection_attempts(&self) -> i64 {
        self.connection_attempts.load(Ordering::Relaxed)
    }

    /// Total TLS handshakes completed.
    pub fn total_tls_established(&self) -> i64 {
        self.tls_established.load(Ordering::Relaxed)
    }
}

impl Default for S2sMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s2s_state() {
        assert_eq!(S2sState::Initial, S2sState::Initial);
        assert_ne!(S2sState::Initial, S2sState::Dialback);
        assert_ne!(S2sState::Dialback, S2sState::Established);
        assert_ne!(S2sState::Established, S2sState::Closed);
    }

    #[test]
    fn test_s2s_direction() {
        assert_eq!(S2sDirection::Inbound, S2sDirection::Inbound);
        assert_ne!(S2sDirection::Inbound, S2sDirection::Outbound);
    }

    #[test]
    fn test_s2s_metrics() {
        let metrics = S2sMetrics::new();

        assert_eq!(metrics.active_connections(), 0);
        assert_eq!(metrics.total_connection_attempts(), 0);

        metrics.record_connection_attempt();
        assert_eq!(metrics.total_connection_attempts(), 1);

        metrics.record_connection_established();
        assert_eq!(metrics.active_connections(), 1);

        metrics.record_connection_closed();
        assert_eq!(metrics.active_connections(), 0);
    }
}
