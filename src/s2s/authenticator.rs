//! Authenticator entry point (component F).
//!
//! The single public entry point the rest of the server calls to obtain an
//! authorized outgoing session for a `(local, remote)` pair: `authenticate_domain`.

use crate::config::S2sConfig;
use crate::error::S2sError;
use crate::metrics;
use crate::s2s::dialback::DialbackKey;
use crate::s2s::domain_pair::{DomainPair, RouteRegistrar};
use crate::s2s::handshake::HandshakeEngine;
use crate::s2s::mutex_registry::RemoteAuthMutexRegistry;
use crate::s2s::reuse::{ReuseOutcome, ReusePlanner};
use crate::s2s::session::OutgoingServerSession;
use crate::s2s::session_registry::SessionRegistry;
use crate::s2s::transport::{ConnectionFactory, Socket, SocketFactory};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Consulted once per attempt to decide whether federation with `remote`
/// is permitted at all, and which port to dial.
pub trait RemoteServerManager: Send + Sync {
    /// Whether federation is enabled and `remote` is not blocklisted.
    fn can_access(&self, remote: &str) -> bool;

    /// The port to dial for `remote`, honoring any per-domain override.
    /// Defaults to 5269 when no override exists.
    fn port_for(&self, remote: &str) -> u16;
}

/// Notified whenever a session becomes usable, whether freshly
/// handshaken or satisfied via reuse.
pub trait SessionEventPublisher: Send + Sync {
    fn session_created(&self, session: &Arc<OutgoingServerSession>);
}

/// Ties components B through E together behind the one entry point the
/// rest of the server calls.
pub struct Authenticator<'a> {
    config: &'a S2sConfig,
    registry: &'a SessionRegistry,
    mutexes: &'a RemoteAuthMutexRegistry,
    dialback_key: &'a DialbackKey,
    server_manager: &'a dyn RemoteServerManager,
    socket_factory: &'a dyn SocketFactory,
    connection_factory: &'a dyn ConnectionFactory,
    events: &'a dyn SessionEventPublisher,
}

impl<'a> Authenticator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a S2sConfig,
        registry: &'a SessionRegistry,
        mutexes: &'a RemoteAuthMutexRegistry,
        dialback_key: &'a DialbackKey,
        server_manager: &'a dyn RemoteServerManager,
        socket_factory: &'a dyn SocketFactory,
        connection_factory: &'a dyn ConnectionFactory,
        events: &'a dyn SessionEventPublisher,
    ) -> Self {
        Self {
            config,
            registry,
            mutexes,
            dialback_key,
            server_manager,
            socket_factory,
            connection_factory,
            events,
        }
    }

    /// Obtain an authorized session for `pair`, reusing an existing one if
    /// possible and otherwise performing a full handshake. Returns `true`
    /// iff `pair` is now authorized on some live session.
    #[instrument(skip(self), fields(local = %pair.local(), remote = %pair.remote()))]
    pub async fn authenticate_domain(&self, pair: &DomainPair) -> bool {
        let remote = pair.remote();

        // 1. Input validation.
        if remote.trim().is_empty() || remote.chars().any(char::is_whitespace) {
            warn!("rejecting authenticate_domain: invalid remote domain");
            return false;
        }

        // 2. Policy.
        if !self.server_manager.can_access(remote) {
            metrics::record_auth_attempt("policy", false);
            return false;
        }

        let remote_owned = remote.to_string();
        let pair = pair.clone();

        // 3. Serialize per-remote attempts.
        self.mutexes
            .with_remote_lock(&remote_owned, || async { self.authenticate_locked(&pair).await })
            .await
    }

    async fn authenticate_locked(&self, pair: &DomainPair) -> bool {
        // 4. Ask the reuse planner first.
        let planner = ReusePlanner::new(self.registry, self.dialback_key);
        match planner.plan(pair).await {
            Ok(ReuseOutcome::Reused(session)) => {
                metrics::record_auth_attempt("reuse", true);
                self.events.session_created(&session);
                return true;
            }
            Ok(ReuseOutcome::NotFound) => {}
            Err(e) => {
                warn!(error = %e, "reuse planning failed, falling back to full handshake");
            }
        }

        // 5. Determine port.
        let port = self.server_manager.port_for(pair.remote());

        // 6. Full handshake.
        match self.full_handshake(pair, port).await {
            Ok(session) => {
                metrics::record_auth_attempt("handshake", true);
                let key = session.session_key().await;
                self.registry.register(key.clone(), session.clone());
                self.registry.register_route(pair, &key);
                self.events.session_created(&session);
                true
            }
            Err(e) => {
                // 7. Any failure: nothing partially registered, report false.
                metrics::record_auth_attempt("handshake", false);
                info!(error = %e, remote = %pair.remote(), "handshake failed");
                false
            }
        }
    }

    async fn full_handshake(
        &self,
        pair: &DomainPair,
        port: u16,
    ) -> Result<Arc<OutgoingServerSession>, S2sError> {
        let (mut socket, direct_tls) = self
            .socket_factory
            .create_socket_to_xmpp_domain(pair.remote(), port)
            .await
            .ok_or_else(|| S2sError::connect_error("no socket target available"))?;

        let addr = {
            use std::net::ToSocketAddrs;
            format!("{}:{}", pair.remote(), port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut it| it.next())
                .ok_or_else(|| S2sError::connect_error("could not resolve socket address"))?
        };
        socket.connect(addr, self.config.connect_timeout).await?;

        let connection = self.connection_factory.make_connection(socket.as_ref()).await;

        let engine = HandshakeEngine::new(self.config, self.socket_factory, self.dialback_key);
        let outcome = tokio::time::timeout(
            self.config.handshake_timeout,
            engine.run(pair, port, connection.clone(), socket, direct_tls),
        )
        .await
        .map_err(|_| S2sError::unavailable("handshake deadline exceeded"))??;

        let session_key = format!("{}|{}", pair.remote(), outcome.stream_id);
        let session = Arc::new(OutgoingServerSession::new(
            pair.remote(),
            outcome.stream_id,
            outcome.connection,
            outcome.authentication_method,
            outcome.is_encrypted,
            outcome.transport_kind,
            session_key,
        ));
        session.authorize_pair(pair.clone()).await;
        Ok(session)
    }
}
