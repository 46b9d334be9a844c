//! Session registry (component C).
//!
//! Tracks every live outgoing session and the domain pairs each one
//! currently authorizes, so that lookups by `(local, remote)` pair are O(1)
//! and so the reuse planner (component E) can discover alternative domains
//! already reachable through an established dialback session.

use crate::s2s::domain_pair::{DomainPair, RouteRegistrar};
use crate::s2s::session::OutgoingServerSession;
use dashmap::DashMap;
use std::sync::Arc;

/// A minimal view of an incoming session, as produced by the dialback
/// responder (out of scope here, consumed only through this trait).
#[derive(Debug, Clone)]
pub struct IncomingSessionRef {
    /// Domain the peer validated via dialback on this incoming session.
    pub validated_domain: String,
    /// Opaque identifier for the incoming session.
    pub session_key: String,
}

/// Supplies the set of incoming sessions that have validated a given
/// remote domain. Implemented by the (out-of-scope) dialback responder.
pub trait IncomingSessionSource: Send + Sync {
    /// Incoming sessions from peers that have validated `remote`.
    fn incoming_sessions_for(&self, remote: &str) -> Vec<IncomingSessionRef>;
}

fn pair_key(pair: &DomainPair) -> (String, String) {
    (pair.local().to_lowercase(), pair.remote().to_lowercase())
}

/// Registry of live outgoing sessions, indexed both by session key and by
/// the domain pairs each session authorizes.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<OutgoingServerSession>>,
    pair_index: DashMap<(String, String), String>,
    incoming_source: Option<Arc<dyn IncomingSessionSource>>,
}

impl SessionRegistry {
    /// Create an empty registry with no incoming-session collaborator.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            pair_index: DashMap::new(),
            incoming_source: None,
        }
    }

    /// Attach the collaborator that answers `incoming_sessions_for`.
    pub fn with_incoming_source(mut self, source: Arc<dyn IncomingSessionSource>) -> Self {
        self.incoming_source = Some(source);
        self
    }

    /// Record a freshly authenticated outgoing session under `session_key`.
    /// Exactly one session may be registered per `(local, remote)` pair; if
    /// the session already authorizes pairs at registration time (it must,
    /// per invariant 1), those pairs become looked-up through this
    /// registry immediately.
    pub fn register(&self, session_key: impl Into<String>, session: Arc<OutgoingServerSession>) {
        self.sessions.insert(session_key.into(), session);
    }

    /// Look up the session currently serving `pair`, if any.
    pub fn get_outgoing(&self, pair: &DomainPair) -> Option<Arc<OutgoingServerSession>> {
        let session_key = self.pair_index.get(&pair_key(pair))?.clone();
        self.sessions.get(&session_key).map(|s| s.clone())
    }

    /// Incoming sessions from peers that have validated `remote`, used by
    /// the reuse planner to discover alternative domains hosted by the
    /// same peer. Returns an empty list if no incoming-session source is
    /// attached.
    pub fn incoming_sessions_for(&self, remote: &str) -> Vec<IncomingSessionRef> {
        self.incoming_source
            .as_ref()
            .map(|s| s.incoming_sessions_for(remote))
            .unwrap_or_default()
    }

    /// Remove a session entirely (on transport close or operator eviction),
    /// along with every pair it served.
    pub fn remove(&self, session_key: &str) {
        self.sessions.remove(session_key);
        self.pair_index.retain(|_, v| v != session_key);
    }

    /// Number of live sessions. Exposed for diagnostics/tests.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteRegistrar for SessionRegistry {
    fn register_route(&self, pair: &DomainPair, session_key: &str) {
        self.pair_index
            .insert(pair_key(pair), session_key.to_string());
    }
}
