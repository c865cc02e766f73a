use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use rustls::pki_types::CertificateDer;
use tracing::warn;

use crate::config::TransportConfig;
use crate::credentials::verify::SkipServerVerification;
use crate::credentials::{ALPN_GRPC_QUIC, AuthInfo, Identity, Verification, crypto_provider, root_store};
use crate::error::Error;

/// How the client decides whether to trust the server's certificate.
#[derive(Debug, Clone)]
pub enum TrustPolicy {
    /// Verify the server against these roots.
    Roots(Vec<CertificateDer<'static>>),
    /// Accept any server certificate. Insecure; for local testing only.
    InsecureSkipVerify,
}

/// Client-side half of the credential adapter.
///
/// There is intentionally no `Default`: callers must pick a trust policy, and
/// skipping verification is only available through
/// [`ClientCredentials::insecure_skip_verify`].
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    trust: TrustPolicy,
    alpn_protocols: Vec<Vec<u8>>,
    server_name: Option<String>,
    identity: Option<Identity>,
}

impl ClientCredentials {
    /// Verify servers against the given trust roots.
    pub fn with_roots(roots: impl IntoIterator<Item = CertificateDer<'static>>) -> Self {
        Self::new(TrustPolicy::Roots(roots.into_iter().collect()))
    }

    /// Accept any server certificate.
    pub fn insecure_skip_verify() -> Self {
        Self::new(TrustPolicy::InsecureSkipVerify)
    }

    pub fn new(trust: TrustPolicy) -> Self {
        Self {
            trust,
            alpn_protocols: vec![ALPN_GRPC_QUIC.to_vec()],
            server_name: None,
            identity: None,
        }
    }

    /// Replace the list of application protocols offered to the server.
    pub fn with_alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Verify the server against this name instead of the dial target's host.
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    /// Present a client certificate for mutual TLS.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn trust(&self) -> &TrustPolicy {
        &self.trust
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    /// The name the server certificate is verified against when dialing `host`.
    pub fn server_name_for<'a>(&'a self, host: &'a str) -> &'a str {
        self.server_name.as_deref().unwrap_or(host)
    }

    /// Stable digest of the security configuration, used to key shared sessions.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = ahash::RandomState::with_seeds(
            0x6772_7063_2d71_7569,
            0x632d_7472_7573_7431,
            0x0bad_5eed_0bad_5eed,
            0x1234_5678_9abc_def0,
        )
        .build_hasher();

        match &self.trust {
            TrustPolicy::Roots(roots) => {
                0u8.hash(&mut hasher);
                for root in roots {
                    root.as_ref().hash(&mut hasher);
                }
            }
            TrustPolicy::InsecureSkipVerify => 1u8.hash(&mut hasher),
        }
        self.alpn_protocols.hash(&mut hasher);
        self.server_name.hash(&mut hasher);
        if let Some(leaf) = self.identity.as_ref().and_then(Identity::leaf) {
            leaf.as_ref().hash(&mut hasher);
        }

        hasher.finish()
    }

    /// Build the quinn client configuration for these credentials.
    pub fn client_config(&self, transport: &TransportConfig) -> Result<quinn::ClientConfig, Error> {
        if self.alpn_protocols.is_empty() {
            return Err(Error::Config("at least one ALPN protocol is required".to_string()));
        }

        let provider = crypto_provider();
        let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| Error::Config(format!("failed to set protocol versions: {e}")))?;

        let builder = match &self.trust {
            TrustPolicy::Roots(roots) => {
                if roots.is_empty() {
                    return Err(Error::UntrustedPeer(
                        "verification required but no trust roots configured".to_string(),
                    ));
                }
                builder.with_root_certificates(root_store(roots)?)
            }
            TrustPolicy::InsecureSkipVerify => {
                warn!("Server certificate verification is disabled; peers are not authenticated");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(SkipServerVerification::new(provider))
            }
        };

        let mut crypto = match &self.identity {
            Some(identity) => builder
                .with_client_auth_cert(identity.cert_chain.clone(), identity.private_key.clone_key())
                .map_err(|e| Error::Config(format!("invalid client identity: {e}")))?,
            None => builder.with_no_client_auth(),
        };
        crypto.alpn_protocols = self.alpn_protocols.clone();

        let quic = QuicClientConfig::try_from(crypto)
            .map_err(|e| Error::Config(format!("failed to create QUIC client config: {e}")))?;

        let mut client_config = quinn::ClientConfig::new(Arc::new(quic));
        client_config.transport_config(transport.build()?);

        Ok(client_config)
    }

    pub(crate) fn auth_info(&self, connection: &quinn::Connection) -> Result<AuthInfo, Error> {
        let trust = &self.trust;
        AuthInfo::from_connection(connection, &self.alpn_protocols, |presented| {
            match (trust, presented) {
                (TrustPolicy::InsecureSkipVerify, _) => Verification::Skipped,
                (TrustPolicy::Roots(_), true) => Verification::Verified,
                (TrustPolicy::Roots(_), false) => Verification::NotRequested,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> Vec<CertificateDer<'static>> {
        Identity::self_signed(["localhost"]).unwrap().cert_chain
    }

    #[test]
    fn test_empty_roots_is_untrusted() {
        let creds = ClientCredentials::with_roots(vec![]);
        assert!(matches!(
            creds.client_config(&TransportConfig::default()),
            Err(Error::UntrustedPeer(_))
        ));
    }

    #[test]
    fn test_roots_config_builds() {
        let creds = ClientCredentials::with_roots(roots());
        assert!(creds.client_config(&TransportConfig::default()).is_ok());
    }

    #[test]
    fn test_insecure_config_builds() {
        let creds = ClientCredentials::insecure_skip_verify();
        assert!(matches!(creds.trust(), TrustPolicy::InsecureSkipVerify));
        assert!(creds.client_config(&TransportConfig::default()).is_ok());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let roots = roots();
        let a = ClientCredentials::with_roots(roots.clone());
        let b = ClientCredentials::with_roots(roots);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_security_settings() {
        let roots = roots();
        let verified = ClientCredentials::with_roots(roots.clone());
        let insecure = ClientCredentials::insecure_skip_verify();
        let renamed = ClientCredentials::with_roots(roots).with_server_name("example.test");

        assert_ne!(verified.fingerprint(), insecure.fingerprint());
        assert_ne!(verified.fingerprint(), renamed.fingerprint());
    }

    #[test]
    fn test_server_name_override() {
        let creds = ClientCredentials::insecure_skip_verify();
        assert_eq!(creds.server_name_for("localhost"), "localhost");

        let creds = creds.with_server_name("api.internal");
        assert_eq!(creds.server_name_for("localhost"), "api.internal");
    }
}
