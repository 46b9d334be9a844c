//! The outgoing S2S session entity (component C, data half).

use crate::s2s::domain_pair::DomainPairSet;
use crate::s2s::transport::Connection;
use crate::types::Transport;
use std::sync::Arc;
use tokio::sync::Mutex;

/// How a session authenticated its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMethod {
    /// Server Dialback (XEP-0220).
    Dialback,
    /// SASL EXTERNAL using the TLS peer certificate.
    SaslExternal,
}

/// Lifecycle status of an outgoing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Transport connected, handshake not yet complete.
    Connecting,
    /// Handshake complete, at least one domain pair authorized.
    Authenticated,
    /// Transport closed; session no longer usable.
    Closed,
}

/// A session with a specific remote server, established by the outgoing
/// handshake engine.
///
/// `outgoing_domain_pairs` starts empty while `status` is `Connecting` and
/// must be populated before the session transitions to `Authenticated` and
/// becomes visible to the registry — a session is never constructed in a
/// state that looks authenticated without backing authorization (see the
/// handshake engine, which keeps the session local until one full
/// `DomainPairSet::add` call has succeeded).
pub struct OutgoingServerSession {
    /// The remote domain this session was dialed to reach.
    address: String,
    /// Stream ID supplied by the peer at stream open.
    stream_id: String,
    connection: Arc<dyn Connection>,
    authentication_method: AuthenticationMethod,
    outgoing_domain_pairs: Mutex<DomainPairSet>,
    status: Mutex<SessionStatus>,
    is_encrypted: std::sync::atomic::AtomicBool,
    is_detached: std::sync::atomic::AtomicBool,
    transport_kind: Transport,
}

impl OutgoingServerSession {
    /// Construct a new session in `Connecting` status with no authorized
    /// domain pairs. Callers must add at least one pair and transition to
    /// `Authenticated` before registering it (see [`crate::s2s::session_registry::SessionRegistry::register`]).
    pub fn new(
        address: impl Into<String>,
        stream_id: impl Into<String>,
        connection: Arc<dyn Connection>,
        authentication_method: AuthenticationMethod,
        is_encrypted: bool,
        transport_kind: Transport,
        session_key: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            stream_id: stream_id.into(),
            connection,
            authentication_method,
            outgoing_domain_pairs: Mutex::new(DomainPairSet::new(session_key)),
            status: Mutex::new(SessionStatus::Connecting),
            is_encrypted: std::sync::atomic::AtomicBool::new(is_encrypted),
            is_detached: std::sync::atomic::AtomicBool::new(false),
            transport_kind,
        }
    }

    /// The remote domain this session was dialed to reach.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stream ID supplied by the peer.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The underlying transport connection.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// How this session authenticated.
    pub fn authentication_method(&self) -> AuthenticationMethod {
        self.authentication_method
    }

    /// Whether the transport is TLS-encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Whether the transport has been severed while the session is
    /// logically retained for a grace period.
    pub fn is_detached(&self) -> bool {
        self.is_detached.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Mark the session as detached (transport severed, session logically
    /// retained).
    pub fn mark_detached(&self) {
        self.is_detached
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Transport kind (plain or TLS) at the wire level.
    pub fn transport_kind(&self) -> Transport {
        self.transport_kind
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> SessionStatus {
        *self.status.lock().await
    }

    /// Add an authorized domain pair. If this is the first pair added, the
    /// session transitions from `Connecting` to `Authenticated` (invariant:
    /// an `Authenticated` session always has a non-empty pair set).
    pub async fn authorize_pair(&self, pair: crate::s2s::domain_pair::DomainPair) {
        let mut pairs = self.outgoing_domain_pairs.lock().await;
        pairs.add(pair);
        drop(pairs);

        let mut status = self.status.lock().await;
        if *status == SessionStatus::Connecting {
            *status = SessionStatus::Authenticated;
        }
    }

    /// Snapshot of authorized pairs' remote domains.
    pub async fn authorized_remotes(&self) -> Vec<String> {
        self.outgoing_domain_pairs
            .lock()
            .await
            .all()
            .into_iter()
            .map(|p| p.remote().to_string())
            .collect()
    }

    /// Whether `pair` is currently authorized on this session.
    pub async fn authorizes(&self, pair: &crate::s2s::domain_pair::DomainPair) -> bool {
        self.outgoing_domain_pairs.lock().await.contains(pair)
    }

    /// The key this session is (or will be) registered under in the
    /// session registry. Used to route newly-authorized pairs there.
    pub async fn session_key(&self) -> String {
        self.outgoing_domain_pairs.lock().await.session_key().to_string()
    }

    /// Close the session: close the transport and mark status `Closed`.
    /// Safe to call more than once.
    pub async fn close(&self, reason: Option<&str>) {
        let error = reason.map(crate::s2s::transport::StreamError::new);
        self.connection.close(error).await;
        *self.status.lock().await = SessionStatus::Closed;
    }
}
