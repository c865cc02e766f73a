//! Transport credentials for the QUIC bridge.
//!
//! The QUIC handshake already runs TLS 1.3, so this module is where the RPC
//! layer's notion of "transport security" lives: it builds the rustls
//! configurations for both roles, negotiates the application protocol and
//! turns the outcome into an [`AuthInfo`] snapshot that is attached to every
//! connection derived from the session.

mod auth_info;
mod client;
mod identity;
mod server;
mod verify;

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

pub use auth_info::{AuthInfo, SecurityLevel, Verification};
pub use client::{ClientCredentials, TrustPolicy};
pub use identity::{Identity, load_pem_certs};
pub use server::{ClientAuth, ServerCredentials};

/// Application protocol identifier used to recognise RPC-over-QUIC traffic.
pub const ALPN_GRPC_QUIC: &[u8] = b"grpc-quic";

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub(crate) fn root_store(
    roots: &[rustls::pki_types::CertificateDer<'static>],
) -> Result<rustls::RootCertStore, crate::Error> {
    let mut store = rustls::RootCertStore::empty();
    for cert in roots {
        store
            .add(cert.clone())
            .map_err(|e| crate::Error::Config(format!("invalid trust root: {e}")))?;
    }
    Ok(store)
}
