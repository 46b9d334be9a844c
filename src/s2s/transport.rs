//! Transport abstraction consumed by the handshake engine.
//!
//! Socket creation, DNS resolution, and the TLS stack implementation itself
//! are all provided by the host application. This module only defines the
//! interface the engine drives them through, so the handshake state machine
//! can be written and tested without a real network stack.

use crate::error::S2sError;
use crate::s2s::session::OutgoingServerSession;
use crate::types::StanzaType;
use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

/// TLS enforcement level for a single connection, as seen by the transport
/// layer (mirrors [`crate::config::TlsPolicy`] but is queried per-connection
/// since policy may be overridden per destination).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTlsPolicy {
    Disabled,
    Optional,
    Required,
}

/// A defined-condition stream error, sent to the peer before closing.
#[derive(Debug, Clone)]
pub struct StreamError {
    pub condition: String,
    pub text: Option<String>,
}

impl StreamError {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            text: None,
        }
    }

    pub fn with_text(condition: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            text: Some(text.into()),
        }
    }
}

/// A stanza queued for delivery over an established session, classified for
/// bounce purposes.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stanza_type: StanzaType,
    pub xml: String,
}

/// A raw, not-yet-connected socket target, as produced by DNS/SRV
/// resolution and TCP socket creation (both out of scope here).
#[async_trait]
pub trait Socket: Send + Sync {
    /// Connect to `addr`, aborting if not established within `timeout`.
    async fn connect(&mut self, addr: SocketAddr, timeout: Duration) -> Result<(), S2sError>;

    /// Close the underlying socket.
    async fn close(&mut self);

    /// Set the read timeout for subsequent reads, in milliseconds.
    fn set_read_timeout(&mut self, ms: u64);

    /// The readable half of the socket, for the XML pull reader to consume.
    fn input_stream(&mut self) -> &mut (dyn AsyncRead + Unpin + Send);

    /// The address actually connected to, once `connect` succeeds.
    fn remote_address(&self) -> Option<SocketAddr>;
}

/// Factory for obtaining a socket to a remote XMPP domain, hiding DNS/SRV
/// resolution and socket construction.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Produce a socket targeting `remote` on `port`, and whether Direct TLS
    /// (as opposed to STARTTLS) should be attempted on it. Returns `None`
    /// when no viable target could be produced (exhausted DNS results).
    async fn create_socket_to_xmpp_domain(
        &self,
        remote: &str,
        port: u16,
    ) -> Option<(Box<dyn Socket>, bool)>;
}

/// Wraps a freshly connected [`Socket`] in a [`Connection`], wiring its
/// actual reads/writes (and the TLS stream once `start_tls` is invoked)
/// over it. Provided by the host application, mirroring [`SocketFactory`]:
/// this crate drives the handshake through the `Connection` trait and
/// never constructs one itself.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn make_connection(&self, socket: &dyn Socket) -> Arc<dyn Connection>;
}

/// A connection wrapping a [`Socket`], providing the operations the
/// handshake engine needs: STARTTLS upgrade, raw XML delivery, and
/// lifecycle management.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Upgrade the connection in place to TLS. `client_mode` is always
    /// true for the outgoing engine. `verify_on_start` controls whether
    /// the TLS library performs its own handshake-time certificate checks
    /// (the engine additionally performs RFC 6125 identity verification
    /// itself once the handshake completes).
    async fn start_tls(&self, client_mode: bool, verify_on_start: bool) -> Result<(), S2sError>;

    /// Write raw XML text directly to the wire, bypassing stanza framing.
    /// Used for stream headers and negotiation elements.
    async fn deliver_raw_text(&self, text: &str) -> Result<(), S2sError>;

    /// Read the next chunk of plaintext bytes off the wire (post-TLS
    /// decryption once `start_tls` has completed). Returns an empty
    /// buffer on a read timeout or idle poll; callers loop on that rather
    /// than treating it as end-of-stream. Returns `Err` only on a genuine
    /// transport failure.
    async fn read_buf(&self) -> Result<Vec<u8>, S2sError>;

    /// Deliver a classified stanza once the session is established.
    async fn deliver(&self, packet: &Packet) -> Result<(), S2sError>;

    /// Close the stream gracefully, optionally sending a stream error
    /// first.
    async fn close(&self, error: Option<StreamError>);

    /// Forcibly close the transport without attempting a graceful stream
    /// close (used when the peer is unresponsive or misbehaving).
    async fn force_close(&self);

    /// The TLS policy in effect for this connection.
    fn get_tls_policy(&self) -> ConnectionTlsPolicy;

    /// Peer certificate chain, populated once TLS is established. Empty
    /// before `start_tls` completes.
    fn get_peer_certificates(&self) -> Vec<CertificateDer<'static>>;

    /// Whether the transport has been closed.
    fn is_closed(&self) -> bool;

    /// Bind this connection to its owning session, once the session is
    /// constructed. Allows the connection to notify the session on
    /// unsolicited transport events (e.g. peer-initiated close).
    fn init(&self, session: Arc<OutgoingServerSession>);
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    /// A `Connection` double used by unit tests for components that only
    /// need *a* connection to exist, not real network behavior.
    #[derive(Default)]
    pub struct NullConnection {
        closed: AtomicBool,
        delivered: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Connection for NullConnection {
        async fn start_tls(&self, _client_mode: bool, _verify_on_start: bool) -> Result<(), S2sError> {
            Ok(())
        }

        async fn deliver_raw_text(&self, text: &str) -> Result<(), S2sError> {
            self.delivered.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn read_buf(&self) -> Result<Vec<u8>, S2sError> {
            Ok(Vec::new())
        }

        async fn deliver(&self, packet: &Packet) -> Result<(), S2sError> {
            self.delivered.lock().unwrap().push(packet.xml.clone());
            Ok(())
        }

        async fn close(&self, _error: Option<StreamError>) {
            self.closed.store(true, Ordering::SeqCst);
        }

        async fn force_close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn get_tls_policy(&self) -> ConnectionTlsPolicy {
            ConnectionTlsPolicy::Optional
        }

        fn get_peer_certificates(&self) -> Vec<CertificateDer<'static>> {
            Vec::new()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn init(&self, _session: Arc<OutgoingServerSession>) {}
    }

    /// A `Connection` double that replays a scripted sequence of `read_buf`
    /// results, for tests that drive code reading an actual response off
    /// the wire (e.g. a handshake step or the piggyback planner).
    pub struct ScriptedConnection {
        reads: StdMutex<std::collections::VecDeque<Vec<u8>>>,
        closed: AtomicBool,
        delivered: StdMutex<Vec<String>>,
    }

    impl ScriptedConnection {
        pub fn new(reads: Vec<Vec<u8>>) -> Self {
            Self {
                reads: StdMutex::new(reads.into()),
                closed: AtomicBool::new(false),
                delivered: StdMutex::new(Vec::new()),
            }
        }

        pub fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn start_tls(&self, _client_mode: bool, _verify_on_start: bool) -> Result<(), S2sError> {
            Ok(())
        }

        async fn deliver_raw_text(&self, text: &str) -> Result<(), S2sError> {
            self.delivered.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn read_buf(&self) -> Result<Vec<u8>, S2sError> {
            Ok(self.reads.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn deliver(&self, packet: &Packet) -> Result<(), S2sError> {
            self.delivered.lock().unwrap().push(packet.xml.clone());
            Ok(())
        }

        async fn close(&self, _error: Option<StreamError>) {
            self.closed.store(true, Ordering::SeqCst);
        }

        async fn force_close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn get_tls_policy(&self) -> ConnectionTlsPolicy {
            ConnectionTlsPolicy::Optional
        }

        fn get_peer_certificates(&self) -> Vec<CertificateDer<'static>> {
            Vec::new()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn init(&self, _session: Arc<OutgoingServerSession>) {}
    }

    #[tokio::test]
    async fn test_null_connection_records_deliveries() {
        let conn = NullConnection::default();
        conn.deliver_raw_text("<stream:stream>").await.unwrap();
        assert!(!conn.is_closed());
        conn.close(None).await;
        assert!(conn.is_closed());
    }
}
