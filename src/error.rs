//! Error types for the outgoing S2S engine.

use thiserror::Error;

/// Errors that can occur while establishing or using an outgoing S2S session.
#[derive(Debug, Error)]
pub enum S2sError {
    /// Malformed input: bad JID, bad XML, invalid element structure.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// Policy forbids the attempted action (e.g. domain on a blocklist, TLS
    /// policy requires encryption that peer does not offer).
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// Destination is transiently unavailable (DNS failure, connect refused,
    /// no destination after all targets exhausted).
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// TCP connect attempt failed.
    #[error("connect error: {0}")]
    ConnectError(String),

    /// TLS handshake failed at the protocol level.
    #[error("TLS handshake error: {0}")]
    TLSHandshakeError(String),

    /// TLS handshake succeeded but failed policy (e.g. certificate identity
    /// does not match the target domain).
    #[error("TLS policy violation: {0}")]
    TLSPolicyViolation(String),

    /// SASL EXTERNAL authentication failed.
    #[error("SASL failure: {0}")]
    SASLFailure(String),

    /// Server Dialback verification failed.
    #[error("dialback failure: {0}")]
    DialbackFailure(String),

    /// Failed to parse a received XML element.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying TLS library error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

impl S2sError {
    /// Create a new input-invalid error.
    pub fn input_invalid(msg: impl Into<String>) -> Self {
        Self::InputInvalid(msg.into())
    }

    /// Create a new policy-denied error.
    pub fn policy_denied(msg: impl Into<String>) -> Self {
        Self::PolicyDenied(msg.into())
    }

    /// Create a new unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a new connect error.
    pub fn connect_error(msg: impl Into<String>) -> Self {
        Self::ConnectError(msg.into())
    }

    /// Create a new TLS handshake error.
    pub fn tls_handshake(msg: impl Into<String>) -> Self {
        Self::TLSHandshakeError(msg.into())
    }

    /// Create a new TLS policy violation error.
    pub fn tls_policy_violation(msg: impl Into<String>) -> Self {
        Self::TLSPolicyViolation(msg.into())
    }

    /// Create a new SASL failure error.
    pub fn sasl_failure(msg: impl Into<String>) -> Self {
        Self::SASLFailure(msg.into())
    }

    /// Create a new dialback failure error.
    pub fn dialback_failure(msg: impl Into<String>) -> Self {
        Self::DialbackFailure(msg.into())
    }

    /// Create a new parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Whether this error represents a transient condition worth a bounded
    /// retry (as opposed to one that should fail the send path immediately).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::ConnectError(_) | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_roundtrip_message() {
        let e = S2sError::dialback_failure("bad key");
        assert_eq!(e.to_string(), "dialback failure: bad key");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(S2sError::unavailable("no targets").is_retryable());
        assert!(S2sError::connect_error("refused").is_retryable());
        assert!(!S2sError::policy_denied("blocklisted").is_retryable());
        assert!(!S2sError::tls_policy_violation("cert mismatch").is_retryable());
    }
}
