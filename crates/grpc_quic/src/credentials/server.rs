use std::sync::Arc;
use std::time::Duration;

use quinn::VarInt;
use quinn::crypto::rustls::QuicServerConfig;
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use tracing::debug;

use crate::config::TransportConfig;
use crate::credentials::{ALPN_GRPC_QUIC, AuthInfo, Identity, Verification, crypto_provider, root_store};
use crate::error::Error;

/// Client certificate policy for inbound sessions.
#[derive(Debug, Clone, Default)]
pub enum ClientAuth {
    /// Do not ask clients for a certificate.
    #[default]
    None,
    /// Verify a client certificate if one is presented.
    Optional(Vec<CertificateDer<'static>>),
    /// Reject clients that do not present a certificate trusted by these roots.
    Required(Vec<CertificateDer<'static>>),
}

/// Server-side half of the credential adapter.
#[derive(Debug, Clone)]
pub struct ServerCredentials {
    identity: Identity,
    alpn_protocols: Vec<Vec<u8>>,
    client_auth: ClientAuth,
}

impl ServerCredentials {
    /// Serve with `identity`, accepting the default RPC-over-QUIC protocol.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            alpn_protocols: vec![ALPN_GRPC_QUIC.to_vec()],
            client_auth: ClientAuth::None,
        }
    }

    /// Replace the list of application protocols the server accepts.
    pub fn with_alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Require or allow mutual TLS.
    pub fn with_client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.client_auth = client_auth;
        self
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Build the quinn server configuration for these credentials.
    pub fn server_config(&self, transport: &TransportConfig) -> Result<quinn::ServerConfig, Error> {
        if self.alpn_protocols.is_empty() {
            return Err(Error::Config("at least one ALPN protocol is required".to_string()));
        }

        let provider = crypto_provider();
        let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| Error::Config(format!("failed to set protocol versions: {e}")))?;

        let builder = match &self.client_auth {
            ClientAuth::None => builder.with_no_client_auth(),
            ClientAuth::Optional(roots) | ClientAuth::Required(roots) => {
                if roots.is_empty() {
                    return Err(Error::Config(
                        "client authentication enabled but no CA certificates provided".to_string(),
                    ));
                }

                let verifier = WebPkiClientVerifier::builder_with_provider(
                    Arc::new(root_store(roots)?),
                    Arc::clone(&provider),
                );
                let verifier = match self.client_auth {
                    ClientAuth::Optional(_) => verifier.allow_unauthenticated(),
                    _ => verifier,
                };
                let verifier = verifier
                    .build()
                    .map_err(|e| Error::Config(format!("failed to build client verifier: {e}")))?;

                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut crypto = builder
            .with_single_cert(
                self.identity.cert_chain.clone(),
                self.identity.private_key.clone_key(),
            )
            .map_err(|e| Error::Config(format!("invalid server identity: {e}")))?;
        crypto.alpn_protocols = self.alpn_protocols.clone();

        let quic = QuicServerConfig::try_from(crypto)
            .map_err(|e| Error::Config(format!("failed to create QUIC server config: {e}")))?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic));
        server_config.transport_config(transport.build()?);

        Ok(server_config)
    }

    /// Complete the handshake for an inbound session attempt.
    ///
    /// The session is closed and the attempt rejected if the handshake did not
    /// settle on one of the accepted application protocols.
    pub(crate) async fn accept(
        &self,
        incoming: quinn::Incoming,
        handshake_timeout: Duration,
    ) -> Result<(quinn::Connection, AuthInfo), Error> {
        let connecting = incoming.accept().map_err(Error::from_handshake)?;
        let connection = tokio::time::timeout(handshake_timeout, connecting)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::from_handshake)?;

        match self.auth_info(&connection) {
            Ok(auth_info) => Ok((connection, auth_info)),
            Err(e) => {
                debug!(
                    remote = %connection.remote_address(),
                    error = %e,
                    "Closing session without an accepted application protocol"
                );
                connection.close(
                    VarInt::from_u32(Error::CODE_NO_APPLICATION_PROTOCOL),
                    b"no application protocol",
                );
                Err(e)
            }
        }
    }

    pub(crate) fn auth_info(&self, connection: &quinn::Connection) -> Result<AuthInfo, Error> {
        let client_auth = &self.client_auth;
        AuthInfo::from_connection(connection, &self.alpn_protocols, |presented| {
            match (client_auth, presented) {
                (ClientAuth::None, _) => Verification::NotRequested,
                (_, true) => Verification::Verified,
                (_, false) => Verification::NotRequested,
            }
        })
    }
}
