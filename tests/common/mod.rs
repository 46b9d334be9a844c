//! Shared test harness for S2S integration tests.

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::CertificateDer;

/// Install the ring crypto provider for rustls.
/// Must be called once before any TLS operations.
pub fn install_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("failed to install crypto provider");
    });
}

/// Generated TLS credentials for testing, standing in for a remote peer's
/// certificate chain in handshake/dialback tests.
pub struct TestTlsCredentials {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub cert_der: CertificateDer<'static>,
    pub domain: String,
}

impl TestTlsCredentials {
    /// Generate self-signed TLS credentials for `domain`.
    pub fn generate(domain: &str) -> Self {
        let subject_alt_names = vec![domain.to_string()];
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
            .expect("failed to generate test certificate");

        let cert_pem = cert.pem().into_bytes();
        let key_pem = key_pair.serialize_pem().into_bytes();
        let cert_der = CertificateDer::from(cert.der().to_vec());

        Self {
            cert_pem,
            key_pem,
            cert_der,
            domain: domain.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_credentials_for_domain() {
        let creds = TestTlsCredentials::generate("example.org");
        assert_eq!(creds.domain, "example.org");
        assert!(!creds.cert_pem.is_empty());
        assert!(!creds.key_pem.is_empty());
    }
}
