//! Certificate, key and trust-anchor loading.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;

use crate::config::TlsConfig;
use crate::tls::TlsError;

/// Local identity plus the trust roots used to verify the peer.
#[derive(Debug)]
pub struct TlsMaterial {
    pub(crate) certs: Vec<CertificateDer<'static>>,
    pub(crate) key: PrivateKeyDer<'static>,
    pub(crate) roots: Arc<RootCertStore>,
}

impl TlsMaterial {
    /// Load the PEM files named in `config`.
    pub fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let certs = read_file(&config.cert_path)?;
        let key = read_file(&config.key_path)?;
        let ca = read_file(&config.ca_path)?;

        let material = Self::from_pem(&certs, &key, &ca)?;
        tracing::debug!(
            cert_path = %config.cert_path.display(),
            chain_len = material.certs.len(),
            trust_anchors = material.roots.len(),
            "TLS material loaded"
        );
        Ok(material)
    }

    /// Build from in-memory PEM: the local chain (leaf first), its private
    /// key, and one or more trusted CA certificates.
    pub fn from_pem(cert_chain: &[u8], private_key: &[u8], trusted_ca: &[u8]) -> Result<Self, TlsError> {
        let certs = parse_certs(cert_chain, "certificate chain")?;
        let key = rustls_pemfile::private_key(&mut &private_key[..])
            .map_err(|source| TlsError::Pem {
                what: "private key",
                source,
            })?
            .ok_or(TlsError::MissingPem("private key"))?;

        let mut roots = RootCertStore::empty();
        for anchor in parse_certs(trusted_ca, "trusted CA")? {
            roots.add(anchor).map_err(TlsError::TrustAnchor)?;
        }

        Ok(Self {
            certs,
            key,
            roots: Arc::new(roots),
        })
    }

    /// The local certificate chain, leaf first.
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certs(pem: &[u8], what: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem { what, source })?;
    if certs.is_empty() {
        return Err(TlsError::MissingPem(what));
    }
    Ok(certs)
}
