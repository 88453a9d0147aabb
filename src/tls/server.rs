//! Listener-side TLS context.

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::crypto::CryptoProvider;
use rustls::server::danger::ClientCertVerifier;
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, SupportedProtocolVersion};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::net::SessionId;
use crate::tls::material::TlsMaterial;
use crate::tls::verify::{Decide, SessionClientVerifier};
use crate::tls::{default_provider, protocol_versions, TlsError};

struct ServerIdentity {
    certified: Arc<CertifiedKey>,
    client_verifier: Arc<dyn ClientCertVerifier>,
}

#[derive(Debug)]
struct StaticIdentity(Arc<CertifiedKey>);

impl ResolvesServerCert for StaticIdentity {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Server identity, trust roots and protocol versions for a TLS listener.
///
/// Every accepted session gets its own `ServerConfig` so its client
/// verifier can report decisions under that session's id. The identity can be
/// swapped at runtime; sessions already handshaking keep the old one.
pub struct TlsServerContext {
    provider: Arc<CryptoProvider>,
    versions: Vec<&'static SupportedProtocolVersion>,
    identity: ArcSwap<ServerIdentity>,
}

impl std::fmt::Debug for TlsServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerContext")
            .field("versions", &self.versions)
            .finish_non_exhaustive()
    }
}

impl TlsServerContext {
    /// Build from loaded material and the version flags of `config`.
    pub fn new(material: TlsMaterial, config: &TlsConfig) -> Result<Self, TlsError> {
        let provider = default_provider();
        let versions = protocol_versions(config)?;
        let identity = build_identity(&provider, material)?;
        Ok(Self {
            provider,
            versions,
            identity: ArcSwap::from_pointee(identity),
        })
    }

    /// Load material from the files named in `config`.
    pub fn from_config(config: &TlsConfig) -> Result<Self, TlsError> {
        Self::new(TlsMaterial::load(config)?, config)
    }

    /// Replace the identity and trust roots used by later sessions.
    pub fn reload(&self, material: TlsMaterial) -> Result<(), TlsError> {
        let identity = build_identity(&self.provider, material)?;
        self.identity.store(Arc::new(identity));
        tracing::info!("TLS server material reloaded");
        Ok(())
    }

    pub(crate) fn acceptor(&self, session: SessionId, decide: Decide) -> Result<TlsAcceptor, TlsError> {
        let identity = self.identity.load();
        let verifier = SessionClientVerifier::new(session, Arc::clone(&identity.client_verifier), decide);
        let config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&self.versions)?
            .with_client_cert_verifier(Arc::new(verifier))
            .with_cert_resolver(Arc::new(StaticIdentity(Arc::clone(&identity.certified))));
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn build_identity(provider: &Arc<CryptoProvider>, material: TlsMaterial) -> Result<ServerIdentity, TlsError> {
    let signing_key = provider.key_provider.load_private_key(material.key)?;
    let certified = Arc::new(CertifiedKey::new(material.certs, signing_key));
    let client_verifier =
        WebPkiClientVerifier::builder_with_provider(material.roots, Arc::clone(provider)).build()?;
    Ok(ServerIdentity {
        certified,
        client_verifier,
    })
}
