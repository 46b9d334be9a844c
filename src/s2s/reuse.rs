//! Session reuse planner (component E).
//!
//! Before paying for a full handshake, checks whether an existing session
//! already authorizes the requested pair, or could be extended to
//! authorize it via piggyback dialback, per the spec's four-step plan.

use crate::error::S2sError;
use crate::parser::{ParsedStanza, XmlParser};
use crate::s2s::dialback::{build_db_result, DialbackKey, DialbackResult};
use crate::s2s::domain_pair::{DomainPair, RouteRegistrar};
use crate::s2s::session::{AuthenticationMethod, OutgoingServerSession};
use crate::s2s::session_registry::SessionRegistry;
use crate::s2s::transport::Connection;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const PIGGYBACK_TIMEOUT_MS: u64 = 5_000;

/// Outcome of a reuse attempt.
pub enum ReuseOutcome {
    /// An existing session already authorizes, or was successfully
    /// extended via piggyback to authorize, `pair`.
    Reused(Arc<OutgoingServerSession>),
    /// No reuse was possible; a full handshake is required.
    NotFound,
}

/// Plans and executes session reuse for an incoming authentication request.
pub struct ReusePlanner<'a> {
    registry: &'a SessionRegistry,
    dialback_key: &'a DialbackKey,
}

impl<'a> ReusePlanner<'a> {
    pub fn new(registry: &'a SessionRegistry, dialback_key: &'a DialbackKey) -> Self {
        Self {
            registry,
            dialback_key,
        }
    }

    /// Attempt to satisfy `pair` without a fresh handshake.
    pub async fn plan(&self, pair: &DomainPair) -> Result<ReuseOutcome, S2sError> {
        // Step 1: exact session already authorizes the pair.
        if let Some(session) = self.registry.get_outgoing(pair) {
            if session.authorizes(pair).await {
                return Ok(ReuseOutcome::Reused(session));
            }

            // Step 2: SASL EXTERNAL sessions cannot piggyback.
            if session.authentication_method() == AuthenticationMethod::SaslExternal {
                debug!(remote = %pair.remote(), "exact session is SASL EXTERNAL, cannot piggyback");
                return Ok(ReuseOutcome::NotFound);
            }
        }

        // Step 3: look for a dialback session authorized for a sibling
        // domain validated by the same peer.
        for incoming in self.registry.incoming_sessions_for(pair.remote()) {
            let sibling_pair = DomainPair::new(pair.local(), incoming.validated_domain.clone());
            if let Some(session) = self.registry.get_outgoing(&sibling_pair) {
                if session.authentication_method() != AuthenticationMethod::Dialback {
                    continue;
                }

                // Step 4: piggyback dialback over the chosen session.
                if self.piggyback(&session, pair).await? {
                    session.authorize_pair(pair.clone()).await;
                    let key = session.session_key().await;
                    self.registry.register_route(pair, &key);
                    crate::metrics::record_piggyback_authentication();
                    return Ok(ReuseOutcome::Reused(session));
                }
                return Ok(ReuseOutcome::NotFound);
            }
        }

        Ok(ReuseOutcome::NotFound)
    }

    async fn piggyback(
        &self,
        session: &Arc<OutgoingServerSession>,
        pair: &DomainPair,
    ) -> Result<bool, S2sError> {
        let connection: Arc<dyn Connection> = session.connection().clone();
        let key = self
            .dialback_key
            .generate(session.stream_id(), pair.remote(), pair.local());
        let xml = build_db_result(pair.local(), pair.remote(), &key);
        connection.deliver_raw_text(&xml).await?;

        let mut parser = XmlParser::new();
        let verdict = tokio::time::timeout(Duration::from_millis(PIGGYBACK_TIMEOUT_MS), async {
            loop {
                match parser.next_stanza()? {
                    Some(ParsedStanza::DialbackResult {
                        result_type: Some(t),
                        ..
                    }) => return Ok::<_, S2sError>(parse_piggyback_result(&t)),
                    Some(_) => continue,
                    None => {
                        let bytes = connection.read_buf().await?;
                        if bytes.is_empty() {
                            tokio::task::yield_now().await;
                        } else {
                            parser.feed(&bytes);
                        }
                    }
                }
            }
        })
        .await;

        match verdict {
            Ok(Ok(Some(DialbackResult::Valid))) => Ok(true),
            Ok(Ok(_)) => Ok(false),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                debug!(remote = %pair.remote(), "timed out waiting for piggyback dialback result");
                Ok(false)
            }
        }
    }
}

/// Parse a dialback result type string, used by callers observing the
/// async acknowledgment out of band from this planner.
pub fn parse_piggyback_result(result_type: &str) -> Option<DialbackResult> {
    DialbackResult::from_str(result_type)
}
