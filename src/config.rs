//! Runtime configuration for the outgoing S2S engine.
//!
//! Configuration is read from environment variables, following the same
//! convention as the rest of the server: no config-file crate, just
//! `std::env::var` lookups with documented defaults, read once at startup.

use std::time::Duration;

/// TLS policy for outgoing connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Never attempt TLS; dialback only.
    Disabled,
    /// Attempt TLS when offered, fall back to plaintext/dialback if not.
    #[default]
    Optional,
    /// Require TLS; do not fall back to plain dialback if STARTTLS is
    /// unavailable or the handshake fails.
    Required,
}

impl TlsPolicy {
    fn from_env_str(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(Self::Disabled),
            "optional" => Some(Self::Optional),
            "required" => Some(Self::Required),
            _ => None,
        }
    }
}

/// Configuration for the outgoing S2S engine, read from the environment.
///
/// See the individual field docs for the corresponding environment
/// variable and its default.
#[derive(Debug, Clone)]
pub struct S2sConfig {
    /// This server's own domain, used as the `from` in outgoing streams.
    pub local_domain: String,
    /// `XMPP_S2S_REMOTE_PORT` - fallback remote port when DNS SRV/A lookup
    /// does not specify one. Default 5269.
    pub default_remote_port: u16,
    /// `XMPP_S2S_TLS_POLICY` - `disabled` | `optional` | `required`.
    /// Default `optional`.
    pub tls_policy: TlsPolicy,
    /// `XMPP_S2S_TLS_VERIFY_CERT` - enable peer certificate chain
    /// verification. Default true.
    pub tls_verify_certificate: bool,
    /// `XMPP_S2S_TLS_ACCEPT_SELFSIGNED` - permit self-signed peer certs
    /// to pass verification. Default false.
    pub tls_accept_selfsigned: bool,
    /// `XMPP_S2S_STRICT_CERT_VALIDATION` - if true, a certificate
    /// validation failure aborts the session outright; if false, dialback
    /// may still rescue the session. Default false.
    pub strict_certificate_validation: bool,
    /// `XMPP_S2S_TLS_ALLOW_PLAIN_FALLBACK` - on detecting plaintext data
    /// inside what should be a TLS stream, fall back to a plain connection
    /// rather than aborting. Default false.
    pub allow_nondirecttls_fallback: bool,
    /// `XMPP_S2S_DIALBACK_ENABLED` - enable Server Dialback as an
    /// authentication fallback. Default true.
    pub dialback_enabled: bool,
    /// `XMPP_S2S_DIALBACK_FOR_SELFSIGNED` - permit dialback to authenticate
    /// a session whose peer presented a self-signed certificate. Default
    /// true.
    pub dialback_for_selfsigned: bool,
    /// `XMPP_S2S_CONNECT_TIMEOUT_MS` - socket connect timeout.
    /// Default 10000ms.
    pub connect_timeout: Duration,
    /// `XMPP_S2S_HANDSHAKE_TIMEOUT_MS` - overall handshake timeout, from
    /// socket connect through authenticated state. Default 30000ms.
    pub handshake_timeout: Duration,
    /// HMAC secret used to generate Server Dialback keys. Must stay stable
    /// for the lifetime of the process to let previously-issued keys keep
    /// validating. `XMPP_S2S_DIALBACK_SECRET`; generated randomly at
    /// startup if unset (single-process deployments only).
    pub dialback_secret: Vec<u8>,
}

impl S2sConfig {
    /// Build configuration from the process environment.
    pub fn from_env(local_domain: impl Into<String>) -> Self {
        Self {
            local_domain: local_domain.into(),
            default_remote_port: env_u16("XMPP_S2S_REMOTE_PORT", 5269),
            tls_policy: env_var("XMPP_S2S_TLS_POLICY")
                .and_then(|s| TlsPolicy::from_env_str(&s))
                .unwrap_or_default(),
            tls_verify_certificate: env_bool("XMPP_S2S_TLS_VERIFY_CERT", true),
            tls_accept_selfsigned: env_bool("XMPP_S2S_TLS_ACCEPT_SELFSIGNED", false),
            strict_certificate_validation: env_bool("XMPP_S2S_STRICT_CERT_VALIDATION", false),
            allow_nondirecttls_fallback: env_bool("XMPP_S2S_TLS_ALLOW_PLAIN_FALLBACK", false),
            dialback_enabled: env_bool("XMPP_S2S_DIALBACK_ENABLED", true),
            dialback_for_selfsigned: env_bool("XMPP_S2S_DIALBACK_FOR_SELFSIGNED", true),
            connect_timeout: Duration::from_millis(env_u64("XMPP_S2S_CONNECT_TIMEOUT_MS", 10_000)),
            handshake_timeout: Duration::from_millis(env_u64(
                "XMPP_S2S_HANDSHAKE_TIMEOUT_MS",
                30_000,
            )),
            dialback_secret: env_var("XMPP_S2S_DIALBACK_SECRET")
                .map(|s| s.into_bytes())
                .unwrap_or_else(random_secret),
        }
    }

    /// Whether `tls_policy` forbids falling back to unencrypted dialback
    /// when TLS cannot be negotiated.
    pub fn forbids_plain_fallback(&self) -> bool {
        self.tls_policy == TlsPolicy::Required
    }
}

fn random_secret() -> Vec<u8> {
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::rng().fill_bytes(&mut secret);
    secret
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    env_var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in [
            "XMPP_S2S_REMOTE_PORT",
            "XMPP_S2S_TLS_POLICY",
            "XMPP_S2S_TLS_VERIFY_CERT",
        ] {
            std::env::remove_var(key);
        }
        let config = S2sConfig::from_env("local.example");
        assert_eq!(config.default_remote_port, 5269);
        assert_eq!(config.tls_policy, TlsPolicy::Optional);
        assert!(config.tls_verify_certificate);
        assert!(!config.forbids_plain_fallback());
    }

    #[test]
    fn test_required_policy_forbids_fallback() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("XMPP_S2S_TLS_POLICY", "required");
        let config = S2sConfig::from_env("local.example");
        assert_eq!(config.tls_policy, TlsPolicy::Required);
        assert!(config.forbids_plain_fallback());
        std::env::remove_var("XMPP_S2S_TLS_POLICY");
    }

    #[test]
    fn test_bool_parsing() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("XMPP_S2S_DIALBACK_ENABLED", "0");
        let config = S2sConfig::from_env("local.example");
        assert!(!config.dialback_enabled);
        std::env::remove_var("XMPP_S2S_DIALBACK_ENABLED");
    }
}
