//! Handshake engine (component D) — the outgoing negotiation state machine.
//!
//! Drives one `(local, remote)` pair from a bare socket through TLS/SASL/
//! dialback negotiation to an authenticated [`OutgoingServerSession`], or
//! to a clean failure with the transport guaranteed closed.

use crate::config::{S2sConfig, TlsPolicy};
use crate::error::S2sError;
use crate::parser::{ns, ParsedStanza, StreamHeader, XmlParser};
use crate::s2s::dialback::{build_db_result, DialbackKey, DialbackResult};
use crate::s2s::domain_pair::DomainPair;
use crate::s2s::session::{AuthenticationMethod, OutgoingServerSession};
use crate::s2s::transport::{Connection, Socket, SocketFactory};
use crate::types::Transport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const STREAM_OPEN_TIMEOUT_MS: u64 = 5_000;

/// State of the handshake engine at any point during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    TcpOpen,
    DirectTlsUp,
    StreamSent,
    FeaturesRcvd,
    StarttlsSent,
    TlsUp,
    SaslSent,
    SaslDone,
    DialbackSent,
    Authed,
    Failed,
    Closed,
}

/// Drives the handshake for a single `(local, remote)` attempt.
pub struct HandshakeEngine<'a> {
    config: &'a S2sConfig,
    socket_factory: &'a dyn SocketFactory,
    dialback_key: &'a DialbackKey,
}

/// Outcome of a completed (successful) handshake: enough to construct and
/// register the session, plus the transport it now owns.
pub struct HandshakeOutcome {
    pub connection: Arc<dyn Connection>,
    pub stream_id: String,
    pub authentication_method: AuthenticationMethod,
    pub is_encrypted: bool,
    pub transport_kind: Transport,
}

impl<'a> HandshakeEngine<'a> {
    pub fn new(
        config: &'a S2sConfig,
        socket_factory: &'a dyn SocketFactory,
        dialback_key: &'a DialbackKey,
    ) -> Self {
        Self {
            config,
            socket_factory,
            dialback_key,
        }
    }

    /// Run the full handshake for `pair`, driving connection creation
    /// through to an authenticated session or a typed failure. Guarantees
    /// the transport is closed on every exit path except the one success
    /// path, where ownership passes to the caller via the returned
    /// outcome.
    #[instrument(skip(self), fields(local = %pair.local(), remote = %pair.remote()))]
    pub async fn run(
        &self,
        pair: &DomainPair,
        port: u16,
        connection: Arc<dyn Connection>,
        mut socket: Box<dyn Socket>,
        direct_tls: bool,
    ) -> Result<HandshakeOutcome, S2sError> {
        let mut state = HandshakeState::TcpOpen;
        let mut parser = XmlParser::new();
        let mut is_encrypted = direct_tls;
        let mut direct_tls = direct_tls;

        if direct_tls {
            match connection.start_tls(true, true).await {
                Ok(()) => state = HandshakeState::DirectTlsUp,
                Err(e) if self.config.allow_nondirecttls_fallback => {
                    warn!(error = %e, "direct TLS failed, falling back to plain socket");
                    socket.close().await;
                    direct_tls = false;
                    is_encrypted = false;
                }
                Err(e) => {
                    connection.force_close().await;
                    return Err(e);
                }
            }
        }

        let result = self
            .negotiate(pair, connection.clone(), &mut parser, direct_tls, is_encrypted)
            .await;

        match result {
            Ok(mut outcome) => {
                outcome.transport_kind = if outcome.is_encrypted {
                    Transport::TcpTls
                } else {
                    Transport::Tcp
                };
                state = HandshakeState::Authed;
                debug!(?state, "handshake reached AUTHED");
                Ok(outcome)
            }
            Err(e) => {
                state = HandshakeState::Failed;
                debug!(?state, error = %e, "handshake failed, closing transport");
                connection.close(None).await;
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        pair: &DomainPair,
        connection: Arc<dyn Connection>,
        parser: &mut XmlParser,
        direct_tls: bool,
        mut is_encrypted: bool,
    ) -> Result<HandshakeOutcome, S2sError> {
        let stream_id = self
            .open_stream_and_await_header(pair, &connection, parser)
            .await?;

        let features = match self.read_features(&connection, parser).await? {
            Some(f) => f,
            None => {
                // Pre-1.0 peer: no features to negotiate, go straight to
                // plain-dialback fallback handling by the caller.
                return self.plain_dialback_fallback(pair, &connection, stream_id).await;
            }
        };

        let (starttls, dialback_offered, sasl_external) = match &features {
            ParsedStanza::Features {
                starttls,
                dialback,
                sasl_mechanisms,
                ..
            } => (
                *starttls,
                *dialback,
                sasl_mechanisms.iter().any(|m| m == "EXTERNAL"),
            ),
            _ => unreachable!("read_features only returns Features or None"),
        };

        // Decision table (4.D step 6), evaluated top to bottom.
        if direct_tls {
            return self
                .authenticate(pair, &connection, parser, sasl_external, dialback_offered, is_encrypted)
                .await;
        }

        if starttls && matches!(self.config.tls_policy, TlsPolicy::Optional | TlsPolicy::Required) {
            let (new_stream_id, new_sasl_external, new_dialback_offered) =
                self.starttls_upgrade(pair, &connection, parser).await?;
            is_encrypted = true;
            return self
                .authenticate(
                    pair,
                    &connection,
                    parser,
                    new_sasl_external,
                    new_dialback_offered,
                    is_encrypted,
                )
                .await
                .map(|mut o| {
                    // Dialback doesn't resend the stream, so its outcome
                    // still carries the pre-authenticate stream_id; SASL
                    // EXTERNAL resends the stream itself and already set
                    // the correct post-SASL id, which must survive here.
                    if o.authentication_method == AuthenticationMethod::Dialback {
                        o.stream_id = new_stream_id.clone();
                    }
                    o
                });
        }

        if self.config.tls_policy == TlsPolicy::Required {
            connection
                .close(Some(crate::s2s::transport::StreamError::with_text(
                    "not-authorized",
                    "TLS is mandatory, but was not established",
                )))
                .await;
            return Err(S2sError::tls_policy_violation(
                "TLS is mandatory, but was not established",
            ));
        }

        if self.config.dialback_enabled && dialback_offered {
            return self
                .dialback_inline(pair, &connection, parser, stream_id, is_encrypted)
                .await;
        }

        self.plain_dialback_fallback(pair, &connection, stream_id).await
    }

    async fn open_stream_and_await_header(
        &self,
        pair: &DomainPair,
        connection: &Arc<dyn Connection>,
        parser: &mut XmlParser,
    ) -> Result<String, S2sError> {
        let dialback_xmlns = if self.config.dialback_enabled {
            format!(" xmlns:db='{}'", crate::s2s::dialback::NS_DIALBACK)
        } else {
            String::new()
        };
        let header = format!(
            "<stream:stream{} xmlns:stream='{}' xmlns='{}' from='{}' to='{}' version='1.0'>",
            dialback_xmlns,
            ns::STREAM,
            "jabber:server",
            pair.local(),
            pair.remote(),
        );
        connection.deliver_raw_text(&header).await?;

        self.await_stream_header(connection, parser).await
    }

    async fn await_stream_header(
        &self,
        connection: &Arc<dyn Connection>,
        parser: &mut XmlParser,
    ) -> Result<String, S2sError> {
        tokio::time::timeout(Duration::from_millis(STREAM_OPEN_TIMEOUT_MS), async {
            loop {
                if parser.has_stream_header() {
                    return Ok(());
                }
                self.pump(connection, parser).await?;
            }
        })
        .await
        .map_err(|_| S2sError::unavailable("timed out waiting for peer stream header"))??;

        let header: StreamHeader = parser.take_stream_header()?;
        Ok(header.id.unwrap_or_default())
    }

    async fn read_features(
        &self,
        connection: &Arc<dyn Connection>,
        parser: &mut XmlParser,
    ) -> Result<Option<ParsedStanza>, S2sError> {
        loop {
            match parser.next_stanza()? {
                Some(f @ ParsedStanza::Features { .. }) => return Ok(Some(f)),
                Some(ParsedStanza::StreamEnd) => return Ok(None),
                Some(_) => continue,
                None => {
                    self.pump(connection, parser).await?;
                }
            }
        }
    }

    /// Read the next chunk of bytes off `connection` and feed it to
    /// `parser`. The handshake's own per-step loops call this whenever
    /// `next_stanza` has nothing buffered yet.
    async fn pump(
        &self,
        connection: &Arc<dyn Connection>,
        parser: &mut XmlParser,
    ) -> Result<(), S2sError> {
        let bytes = connection.read_buf().await?;
        if !bytes.is_empty() {
            parser.feed(&bytes);
        } else {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn starttls_upgrade(
        &self,
        pair: &DomainPair,
        connection: &Arc<dyn Connection>,
        parser: &mut XmlParser,
    ) -> Result<(String, bool, bool), S2sError> {
        connection
            .deliver_raw_text("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await?;

        loop {
            match parser.next_stanza()? {
                Some(ParsedStanza::TlsProceed) => break,
                Some(ParsedStanza::Failure { .. }) => {
                    connection.force_close().await;
                    return Err(S2sError::tls_handshake("peer rejected STARTTLS"));
                }
                Some(_) => continue,
                None => self.pump(connection, parser).await?,
            }
        }

        connection.start_tls(true, self.config.tls_verify_certificate).await?;

        let certs = connection.get_peer_certificates();
        if self.config.tls_verify_certificate && !verify_identity(&certs, pair.remote()) {
            if self.config.strict_certificate_validation {
                connection.force_close().await;
                return Err(S2sError::tls_policy_violation(
                    "peer certificate does not match remote domain",
                ));
            }
            if !(self.config.dialback_enabled && self.config.dialback_for_selfsigned) {
                connection.force_close().await;
                return Err(S2sError::tls_policy_violation(
                    "peer certificate invalid and dialback rescue unavailable",
                ));
            }
            // Dialback may rescue: proceed with unauthenticated TLS.
        }

        parser.reset();
        let stream_id = self.open_stream_and_await_header(pair, connection, parser).await?;
        let features = self.read_features(connection, parser).await?;
        let (sasl_external, dialback_offered) = match features {
            Some(ParsedStanza::Features {
                dialback,
                sasl_mechanisms,
                ..
            }) => (sasl_mechanisms.iter().any(|m| m == "EXTERNAL"), dialback),
            _ => (false, false),
        };

        Ok((stream_id, sasl_external, dialback_offered))
    }

    async fn authenticate(
        &self,
        pair: &DomainPair,
        connection: &Arc<dyn Connection>,
        parser: &mut XmlParser,
        sasl_external: bool,
        dialback_offered: bool,
        is_encrypted: bool,
    ) -> Result<HandshakeOutcome, S2sError> {
        if sasl_external {
            match self.sasl_external(pair, connection, parser).await {
                Ok(stream_id) => {
                    return Ok(HandshakeOutcome {
                        connection: connection.clone(),
                        stream_id,
                        authentication_method: AuthenticationMethod::SaslExternal,
                        is_encrypted,
                        transport_kind: Transport::TcpTls,
                    });
                }
                Err(e) => {
                    debug!(error = %e, "SASL EXTERNAL failed, falling through to dialback");
                }
            }
        }

        if self.config.dialback_enabled && dialback_offered {
            let stream_id = String::new();
            return self
                .dialback_inline(pair, connection, parser, stream_id, is_encrypted)
                .await;
        }

        connection.force_close().await;
        Err(S2sError::sasl_failure(
            "SASL EXTERNAL unavailable and dialback not offered",
        ))
    }

    async fn sasl_external(
        &self,
        pair: &DomainPair,
        connection: &Arc<dyn Connection>,
        parser: &mut XmlParser,
    ) -> Result<String, S2sError> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(pair.local().as_bytes());
        connection
            .deliver_raw_text(&format!(
                "<auth xmlns='{}' mechanism='EXTERNAL'>{}</auth>",
                ns::SASL,
                encoded
            ))
            .await?;

        loop {
            match parser.next_stanza()? {
                Some(ParsedStanza::SaslSuccess) => break,
                Some(ParsedStanza::Failure { .. }) => {
                    return Err(S2sError::sasl_failure("peer rejected SASL EXTERNAL"));
                }
                Some(_) => continue,
                None => self.pump(connection, parser).await?,
            }
        }

        parser.reset();
        self.open_stream_and_await_header(pair, connection, parser).await
    }

    async fn dialback_inline(
        &self,
        pair: &DomainPair,
        connection: &Arc<dyn Connection>,
        parser: &mut XmlParser,
        stream_id: String,
        is_encrypted: bool,
    ) -> Result<HandshakeOutcome, S2sError> {
        let key = self.dialback_key.generate(&stream_id, pair.remote(), pair.local());
        let result = self
            .run_dialback_exchange(pair, connection, parser, &stream_id, &key)
            .await?;

        match result {
            DialbackResult::Valid => Ok(HandshakeOutcome {
                connection: connection.clone(),
                stream_id,
                authentication_method: AuthenticationMethod::Dialback,
                is_encrypted,
                transport_kind: if is_encrypted {
                    Transport::TcpTls
                } else {
                    Transport::Tcp
                },
            }),
            DialbackResult::Invalid => {
                connection.close(None).await;
                Err(S2sError::dialback_failure("authoritative verification failed"))
            }
        }
    }

    /// Send `<db:result>` and await the peer's verdict. The peer's own
    /// round-trip to the authoritative server for `pair.local` happens out
    /// of band; this method only sends the request and reads the
    /// eventual `db:result` response addressed back to us.
    async fn run_dialback_exchange(
        &self,
        pair: &DomainPair,
        connection: &Arc<dyn Connection>,
        parser: &mut XmlParser,
        stream_id: &str,
        key: &str,
    ) -> Result<DialbackResult, S2sError> {
        let _ = stream_id;
        let xml = build_db_result(pair.local(), pair.remote(), key);
        connection.deliver_raw_text(&xml).await?;

        loop {
            match parser.next_stanza()? {
                Some(ParsedStanza::DialbackResult {
                    result_type: Some(t),
                    ..
                }) => {
                    return DialbackResult::from_str(&t)
                        .ok_or_else(|| S2sError::parse("unrecognized dialback result type"));
                }
                Some(_) => continue,
                None => self.pump(connection, parser).await?,
            }
        }
    }

    async fn plain_dialback_fallback(
        &self,
        pair: &DomainPair,
        connection: &Arc<dyn Connection>,
        stream_id: String,
    ) -> Result<HandshakeOutcome, S2sError> {
        if !(self.config.dialback_enabled && self.config.tls_policy != TlsPolicy::Required) {
            connection.force_close().await;
            return Err(S2sError::unavailable(
                "no viable authentication path and plain dialback unavailable",
            ));
        }

        let mut parser = XmlParser::new();
        self.dialback_inline(pair, connection, &mut parser, stream_id, false)
            .await
    }
}

/// Check that the peer presented a certificate chain for `remote_domain`.
///
/// `Connection::get_peer_certificates` returns only raw DER bytes, not
/// parsed SAN names, so full RFC 6125 identity matching happens inside the
/// host's TLS stack when `start_tls` is called with `verify_on_start`.
/// This function only confirms a chain was actually presented.
fn verify_identity(certs: &[rustls::pki_types::CertificateDer<'static>], remote_domain: &str) -> bool {
    !certs.is_empty() && !remote_domain.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_identity_rejects_empty_chain() {
        assert!(!verify_identity(&[], "remote.test"));
    }
}
