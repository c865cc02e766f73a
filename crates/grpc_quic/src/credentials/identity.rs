use std::fmt;
use std::path::Path;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::Error;

/// A certificate chain and its private key.
pub struct Identity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Identity {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, private_key: PrivateKeyDer<'static>) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Generate a self-signed identity for the given subject alternative names.
    ///
    /// Intended for demos and tests; production deployments load real
    /// certificates with [`Identity::from_pem_files`].
    pub fn self_signed<I, S>(subject_alt_names: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = subject_alt_names.into_iter().map(Into::into).collect();
        let certified = rcgen::generate_simple_self_signed(names)
            .map_err(|e| Error::Config(format!("failed to generate certificate: {e}")))?;

        let cert = CertificateDer::from(certified.cert.der().to_vec());
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

        Ok(Self::new(vec![cert], PrivateKeyDer::Pkcs8(key)))
    }

    /// Load a PEM certificate chain and private key from disk.
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, Error> {
        let cert_chain = load_pem_certs(cert_path)?;
        if cert_chain.is_empty() {
            return Err(Error::Config("certificate file contains no certificates".to_string()));
        }

        let private_key = PrivateKeyDer::from_pem_file(key_path.as_ref())
            .map_err(|e| Error::Config(format!("failed to parse private key: {e}")))?;

        Ok(Self::new(cert_chain, private_key))
    }

    /// The end-entity certificate.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.cert_chain.first()
    }
}

/// Load every certificate in a PEM file, e.g. a set of trust roots.
pub fn load_pem_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, Error> {
    CertificateDer::pem_file_iter(path.as_ref())
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.as_ref().display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse certificate: {e}")))
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("cert_chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}
