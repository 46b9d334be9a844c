//! Common types shared across the S2S engine.

use serde::{Deserialize, Serialize};

/// Transport type for an S2S connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// Plain TCP (pre-STARTTLS, or Direct TLS not yet negotiated)
    Tcp,
    /// TCP with TLS established (post-STARTTLS, or Direct TLS)
    TcpTls,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::TcpTls => write!(f, "tcp+tls"),
        }
    }
}

/// Stanza type, used to classify bounce-eligible stanzas and for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaType {
    /// Message stanza
    Message,
    /// Presence stanza
    Presence,
    /// IQ (info/query) stanza
    Iq,
}

impl std::fmt::Display for StanzaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StanzaType::Message => write!(f, "message"),
            StanzaType::Presence => write!(f, "presence"),
            StanzaType::Iq => write!(f, "iq"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_display() {
        assert_eq!(Transport::Tcp.to_string(), "tcp");
        assert_eq!(Transport::TcpTls.to_string(), "tcp+tls");
    }

    #[test]
    fn test_stanza_type_display() {
        assert_eq!(StanzaType::Message.to_string(), "message");
        assert_eq!(StanzaType::Presence.to_string(), "presence");
        assert_eq!(StanzaType::Iq.to_string(), "iq");
    }
}
