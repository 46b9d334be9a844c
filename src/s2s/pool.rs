//! Outgoing S2S connection pool — the facade the rest of the server talks
//! to, tying the authenticator, session registry, and mutex registry
//! together behind a small send-oriented API.

use crate::config::S2sConfig;
use crate::error::S2sError;
use crate::s2s::authenticator::{Authenticator, RemoteServerManager, SessionEventPublisher};
use crate::s2s::bounce::{self, OutgoingStanza};
use crate::s2s::dialback::DialbackKey;
use crate::s2s::domain_pair::DomainPair;
use crate::s2s::mutex_registry::RemoteAuthMutexRegistry;
use crate::s2s::session_registry::SessionRegistry;
use crate::s2s::transport::{ConnectionFactory, Packet, SocketFactory};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Dispatches a bounce packet back into the local routing table, addressed
/// to the sender that originated the unauthorized stanza. Implemented by
/// the (out-of-scope) packet router.
pub trait PacketRouter: Send + Sync {
    fn dispatch(&self, packet: Packet);
}

/// Extract the domain portion of a bare or full JID (text after the last
/// `@`, or the whole string if there is none).
fn bare_domain(jid: &str) -> &str {
    jid.rsplit('@').next().unwrap_or(jid)
}

/// Configuration for the connection pool layer above the authenticator.
#[derive(Debug, Clone)]
pub struct S2sPoolConfig {
    /// Maximum simultaneous sessions maintained per remote domain. The
    /// handshake engine and reuse planner target exactly one session per
    /// `(local, remote)` pair; this bounds incidental extras kept around
    /// during reconnect races.
    pub max_connections_per_domain: usize,
    /// Socket connect timeout.
    pub connect_timeout: Duration,
    /// How long an idle session may sit before eligible for eviction.
    pub idle_timeout: Duration,
    /// Interval between liveness checks on pooled sessions.
    pub health_check_interval: Duration,
    /// Whether to consult DNS SRV records (vs. going straight to A/AAAA).
    pub use_dns_srv: bool,
}

impl Default for S2sPoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_domain: 4,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
            use_dns_srv: true,
        }
    }
}

/// Retry policy for failed connection attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt number `attempt` (0-indexed), capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

/// Lifecycle state of one pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PooledConnectionState {
    Connecting,
    Ready,
    Unhealthy,
    Closed,
}

/// Pool-level metrics, public fields for direct atomic access by callers
/// (mirrors the style of [`crate::s2s::S2sMetrics`]).
#[derive(Debug)]
pub struct S2sPoolMetrics {
    pub active_connections: AtomicI64,
    pub connections_created: AtomicU64,
}

impl S2sPoolMetrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicI64::new(0),
            connections_created: AtomicU64::new(0),
        }
    }

    /// Record a new pooled connection coming online.
    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pooled connection going away.
    pub fn record_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for S2sPoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors surfaced from the pool's send path.
#[derive(Debug, Error)]
pub enum S2sPoolError {
    /// The pool has been shut down and no longer accepts sends.
    #[error("S2S pool is shut down")]
    Shutdown,

    /// No authorized session could be obtained for the destination domain.
    #[error("not authorized for domain: {0}")]
    NotAuthorized(String),

    /// An authorized session exists but the send itself failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl From<S2sError> for S2sPoolError {
    fn from(e: S2sError) -> Self {
        S2sPoolError::SendFailed(e.to_string())
    }
}

/// The outgoing S2S connection pool: the one object the rest of the
/// server holds a handle to.
pub struct S2sConnectionPool {
    local_domain: String,
    config: S2sConfig,
    pool_config: S2sPoolConfig,
    retry_config: RetryConfig,
    registry: SessionRegistry,
    mutexes: RemoteAuthMutexRegistry,
    dialback_key: DialbackKey,
    server_manager: Arc<dyn RemoteServerManager>,
    socket_factory: Arc<dyn SocketFactory>,
    connection_factory: Arc<dyn ConnectionFactory>,
    events: Arc<dyn SessionEventPublisher>,
    packet_router: Arc<dyn PacketRouter>,
    metrics: S2sPoolMetrics,
    shutdown: AtomicBool,
}

impl S2sConnectionPool {
    /// Construct a new pool for `local_domain`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_domain: impl Into<String>,
        config: S2sConfig,
        pool_config: S2sPoolConfig,
        retry_config: RetryConfig,
        server_manager: Arc<dyn RemoteServerManager>,
        socket_factory: Arc<dyn SocketFactory>,
        connection_factory: Arc<dyn ConnectionFactory>,
        events: Arc<dyn SessionEventPublisher>,
        packet_router: Arc<dyn PacketRouter>,
    ) -> Self {
        let dialback_key = DialbackKey::new(config.dialback_secret.clone());
        Self {
            local_domain: local_domain.into(),
            config,
            pool_config,
            retry_config,
            registry: SessionRegistry::new(),
            mutexes: RemoteAuthMutexRegistry::new(),
            dialback_key,
            server_manager,
            socket_factory,
            connection_factory,
            events,
            packet_router,
            metrics: S2sPoolMetrics::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Pool-level configuration.
    pub fn pool_config(&self) -> &S2sPoolConfig {
        &self.pool_config
    }

    /// Retry policy in effect.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    /// Pool-level metrics.
    pub fn metrics(&self) -> &S2sPoolMetrics {
        &self.metrics
    }

    /// Stop accepting new sends. In-flight sends are unaffected.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn authenticator(&self) -> Authenticator<'_> {
        Authenticator::new(
            &self.config,
            &self.registry,
            &self.mutexes,
            &self.dialback_key,
            self.server_manager.as_ref(),
            self.socket_factory.as_ref(),
            self.connection_factory.as_ref(),
            self.events.as_ref(),
        )
    }

    /// Send raw stanza bytes to `remote_domain`, authenticating (or
    /// reusing an existing authorization for) the destination pair first.
    pub async fn send_stanza(&self, remote_domain: &str, bytes: &[u8]) -> Result<(), S2sPoolError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(S2sPoolError::Shutdown);
        }

        let pair = DomainPair::new(self.local_domain.clone(), remote_domain);
        if !self.authenticator().authenticate_domain(&pair).await {
            return Err(S2sPoolError::NotAuthorized(remote_domain.to_string()));
        }

        let session = self
            .registry
            .get_outgoing(&pair)
            .ok_or_else(|| S2sPoolError::NotAuthorized(remote_domain.to_string()))?;

        let text = std::str::from_utf8(bytes)
            .map_err(|e| S2sPoolError::SendFailed(e.to_string()))?;
        session
            .connection()
            .deliver_raw_text(text)
            .await
            .map_err(|e| {
                warn!(domain = %remote_domain, error = %e, "stanza delivery failed");
                S2sPoolError::from(e)
            })
    }

    /// The send path's entry point into component G: check whether
    /// `stanza`'s domain pair is (or can be made, via the reuse planner's
    /// piggyback step) authorized on a live session; if not, asynchronously
    /// dispatch the appropriate bounce through the packet router. Returns
    /// whether the stanza can proceed to delivery.
    pub async fn can_process(&self, stanza: OutgoingStanza) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            self.spawn_bounce(stanza);
            return false;
        }

        let pair = DomainPair::new(
            bare_domain(&stanza.from).to_string(),
            bare_domain(&stanza.to).to_string(),
        );

        let already_authorized = match self.registry.get_outgoing(&pair) {
            Some(session) => session.authorizes(&pair).await,
            None => false,
        };

        let authorized = already_authorized || self.authenticator().authenticate_domain(&pair).await;

        if !authorized {
            self.spawn_bounce(stanza);
        }
        authorized
    }

    fn spawn_bounce(&self, stanza: OutgoingStanza) {
        let router = self.packet_router.clone();
        tokio::spawn(async move {
            if let Some(packet) = bounce::build_bounce(&stanza) {
                router.dispatch(packet);
            }
        });
    }

    /// Number of live sessions currently pooled.
    pub fn session_count(&self) -> usize {
        self.registry.session_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = S2sPoolConfig::default();
        assert!(config.max_connections_per_domain > 0);
        assert!(config.connect_timeout > Duration::ZERO);
        assert!(config.idle_timeout > Duration::ZERO);
        assert!(config.health_check_interval > Duration::ZERO);
        assert!(config.use_dns_srv);
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert!(config.max_attempts > 0);
        assert!(config.initial_delay > Duration::ZERO);
        assert!(config.max_delay > config.initial_delay);
        assert!(config.backoff_multiplier > 1.0);
    }

    #[test]
    fn test_retry_backoff_is_monotonic_and_capped() {
        let config = RetryConfig::default();
        let d0 = config.delay_for_attempt(0);
        let d1 = config.delay_for_attempt(1);
        assert!(d1 >= d0);
        let d_far = config.delay_for_attempt(50);
        assert_eq!(d_far, config.max_delay);
    }

    #[test]
    fn test_pool_metrics_lifecycle() {
        let metrics = S2sPoolMetrics::new();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.connections_created.load(Ordering::Relaxed), 0);

        metrics.record_connection_created();
        assert_eq!(metrics.connections_created.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);

        metrics.record_connection_closed();
        assert_eq!(metrics.connections_created.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_pooled_connection_state_equality() {
        assert_eq!(PooledConnectionState::Ready, PooledConnectionState::Ready);
        assert_ne!(PooledConnectionState::Ready, PooledConnectionState::Unhealthy);
    }

    struct DenyAll;
    impl RemoteServerManager for DenyAll {
        fn can_access(&self, _remote: &str) -> bool {
            false
        }
        fn port_for(&self, _remote: &str) -> u16 {
            5269
        }
    }

    struct NoopFactory;
    #[async_trait::async_trait]
    impl SocketFactory for NoopFactory {
        async fn create_socket_to_xmpp_domain(
            &self,
            _remote: &str,
            _port: u16,
        ) -> Option<(Box<dyn crate::s2s::transport::Socket>, bool)> {
            None
        }
    }

    struct NoopEvents;
    impl SessionEventPublisher for NoopEvents {
        fn session_created(&self, _session: &Arc<crate::s2s::session::OutgoingServerSession>) {}
    }

    struct NullConnectionFactory;
    #[async_trait::async_trait]
    impl ConnectionFactory for NullConnectionFactory {
        async fn make_connection(
            &self,
            _socket: &dyn crate::s2s::transport::Socket,
        ) -> Arc<dyn crate::s2s::transport::Connection> {
            Arc::new(crate::s2s::transport::tests::NullConnection::default())
        }
    }

    #[derive(Default)]
    struct RecordingPacketRouter {
        dispatched: std::sync::Mutex<Vec<Packet>>,
    }

    impl PacketRouter for RecordingPacketRouter {
        fn dispatch(&self, packet: Packet) {
            self.dispatched.lock().unwrap().push(packet);
        }
    }

    fn make_pool(
        server_manager: Arc<dyn RemoteServerManager>,
        packet_router: Arc<dyn PacketRouter>,
    ) -> S2sConnectionPool {
        S2sConnectionPool::new(
            "local.test",
            S2sConfig::from_env("local.test"),
            S2sPoolConfig::default(),
            RetryConfig::default(),
            server_manager,
            Arc::new(NoopFactory),
            Arc::new(NullConnectionFactory),
            Arc::new(NoopEvents),
            packet_router,
        )
    }

    #[tokio::test]
    async fn test_send_stanza_rejects_after_shutdown() {
        let pool = make_pool(Arc::new(DenyAll), Arc::new(RecordingPacketRouter::default()));
        pool.shutdown();
        let result = pool.send_stanza("remote.test", b"<message/>").await;
        assert!(matches!(result, Err(S2sPoolError::Shutdown)));
    }

    #[tokio::test]
    async fn test_send_stanza_not_authorized_when_policy_denies() {
        let pool = make_pool(Arc::new(DenyAll), Arc::new(RecordingPacketRouter::default()));
        let result = pool.send_stanza("remote.test", b"<message/>").await;
        assert!(matches!(result, Err(S2sPoolError::NotAuthorized(_))));
    }

    fn stanza(to: &str) -> OutgoingStanza {
        OutgoingStanza {
            stanza_type: crate::types::StanzaType::Message,
            from: "local.test".to_string(),
            to: to.to_string(),
            id: Some("id-1".to_string()),
            kind: None,
            thread: None,
            raw_xml: "<message from='local.test' to='remote.test'/>".to_string(),
        }
    }

    #[tokio::test]
    async fn test_can_process_bounces_when_unauthorized() {
        let router = Arc::new(RecordingPacketRouter::default());
        let pool = make_pool(Arc::new(DenyAll), router.clone());

        let processed = pool.can_process(stanza("remote.test")).await;
        assert!(!processed);

        // The bounce is dispatched on a spawned task; give it a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(router.dispatched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_can_process_rejects_after_shutdown() {
        let router = Arc::new(RecordingPacketRouter::default());
        let pool = make_pool(Arc::new(DenyAll), router.clone());
        pool.shutdown();

        let processed = pool.can_process(stanza("remote.test")).await;
        assert!(!processed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(router.dispatched.lock().unwrap().len(), 1);
    }
}
