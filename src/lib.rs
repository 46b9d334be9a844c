//! # xmpp-s2s
//!
//! Outgoing XMPP server-to-server (S2S) session establishment engine.
//!
//! Given a `(local_domain, remote_domain)` pair, this crate obtains a
//! connection over which the local server is authorized to send stanzas to
//! the remote domain, coordinating:
//!
//! - a multi-step protocol handshake (TCP, optional direct TLS, stream
//!   open, feature negotiation, STARTTLS, SASL EXTERNAL, server dialback),
//!   with well-defined fallback paths per RFC 6120 and XEP-0220;
//! - connection reuse across multiple domain pairs, including piggyback
//!   authentication of sub/superdomains onto an existing dialback session;
//! - a mutual-exclusion discipline per remote domain so concurrent sends
//!   to the same peer never race two handshakes;
//! - certificate validation policy and precise, typed error semantics.
//!
//! DNS/SRV resolution, TCP socket creation, the TLS stack itself, the XML
//! pull parser's transport, and the dialback responder (incoming) side are
//! all external collaborators, consumed only through the traits in
//! [`s2s::transport`].

pub mod config;
pub mod error;
pub mod metrics;
pub mod parser;
pub mod s2s;
pub mod types;

pub use config::{S2sConfig, TlsPolicy};
pub use error::S2sError;
pub use parser::{ns, StreamHeader};
pub use s2s::pool::{S2sConnectionPool, S2sPoolConfig, S2sPoolError};
pub use types::{StanzaType, Transport};
