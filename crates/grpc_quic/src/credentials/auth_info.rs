use rustls::pki_types::CertificateDer;

use crate::error::Error;

/// Protection offered by the transport, in the terms RPC authorization uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    NoSecurity,
    IntegrityOnly,
    PrivacyAndIntegrity,
}

/// How the peer's identity was established during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The peer presented a certificate that passed the trust policy.
    Verified,
    /// Verification was explicitly disabled by the local configuration.
    Skipped,
    /// The peer was not asked for, or did not present, a certificate.
    NotRequested,
}

/// Immutable snapshot of the security state negotiated for a session.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    protocol: Vec<u8>,
    server_name: Option<String>,
    peer_certificates: Vec<CertificateDer<'static>>,
    verification: Verification,
}

impl AuthInfo {
    /// Value reported by [`AuthInfo::auth_type`].
    pub const AUTH_TYPE: &'static str = "quic-tls";

    /// Capture the negotiated state of a freshly established connection.
    ///
    /// Fails when the handshake did not settle on one of `accepted_protocols`.
    pub(crate) fn from_connection(
        connection: &quinn::Connection,
        accepted_protocols: &[Vec<u8>],
        verification: impl FnOnce(bool) -> Verification,
    ) -> Result<Self, Error> {
        let handshake = connection
            .handshake_data()
            .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok());

        let (protocol, server_name) = match handshake {
            Some(data) => {
                let data = *data;
                (data.protocol, data.server_name)
            }
            None => (None, None),
        };

        let protocol = protocol
            .filter(|negotiated| accepted_protocols.iter().any(|p| p == negotiated))
            .ok_or_else(|| {
                Error::Establishment("no mutually supported application protocol".to_string())
            })?;

        let peer_certificates = connection
            .peer_identity()
            .and_then(|identity| identity.downcast::<Vec<CertificateDer<'static>>>().ok())
            .map(|certs| *certs)
            .unwrap_or_default();

        let verification = verification(!peer_certificates.is_empty());

        Ok(Self {
            protocol,
            server_name,
            peer_certificates,
            verification,
        })
    }

    pub fn auth_type(&self) -> &'static str {
        Self::AUTH_TYPE
    }

    /// The negotiated application protocol identifier.
    pub fn protocol(&self) -> &[u8] {
        &self.protocol
    }

    pub fn protocol_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.protocol).ok()
    }

    /// The SNI value sent by the client, as seen by the server.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Certificate chain presented by the peer, leaf first.
    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.peer_certificates
    }

    /// The peer's end-entity certificate, if one was presented.
    pub fn peer_identity(&self) -> Option<&CertificateDer<'static>> {
        self.peer_certificates.first()
    }

    /// QUIC always encrypts and authenticates packets.
    pub fn security_level(&self) -> SecurityLevel {
        SecurityLevel::PrivacyAndIntegrity
    }

    pub fn verification(&self) -> Verification {
        self.verification
    }

    /// True when the peer presented an identity that passed verification.
    pub fn is_peer_verified(&self) -> bool {
        self.verification == Verification::Verified && !self.peer_certificates.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(protocol: &[u8], verification: Verification) -> Self {
        Self {
            protocol: protocol.to_vec(),
            server_name: None,
            peer_certificates: Vec::new(),
            verification,
        }
    }
}
