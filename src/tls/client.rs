//! Connector-side TLS context.

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, SupportedProtocolVersion};
use tokio_rustls::TlsConnector;

use crate::config::TlsConfig;
use crate::net::SessionId;
use crate::tls::material::TlsMaterial;
use crate::tls::verify::{Decide, SessionServerVerifier};
use crate::tls::{default_provider, protocol_versions, TlsError};

struct ClientIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    server_verifier: Arc<dyn ServerCertVerifier>,
}

/// Client identity, trust roots and protocol versions for a TLS connector.
pub struct TlsClientContext {
    provider: Arc<CryptoProvider>,
    versions: Vec<&'static SupportedProtocolVersion>,
    server_name: Option<ServerName<'static>>,
    identity: ArcSwap<ClientIdentity>,
}

impl std::fmt::Debug for TlsClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClientContext")
            .field("versions", &self.versions)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsClientContext {
    /// Build from loaded material; `config.server_name` overrides the name
    /// derived from the remote address.
    pub fn new(material: TlsMaterial, config: &TlsConfig) -> Result<Self, TlsError> {
        let provider = default_provider();
        let versions = protocol_versions(config)?;
        let server_name = config
            .server_name
            .as_deref()
            .map(parse_server_name)
            .transpose()?;
        let identity = build_identity(&provider, material)?;
        Ok(Self {
            provider,
            versions,
            server_name,
            identity: ArcSwap::from_pointee(identity),
        })
    }

    /// Load material from the files named in `config`.
    pub fn from_config(config: &TlsConfig) -> Result<Self, TlsError> {
        Self::new(TlsMaterial::load(config)?, config)
    }

    /// Replace the identity and trust roots used by later connects.
    pub fn reload(&self, material: TlsMaterial) -> Result<(), TlsError> {
        let identity = build_identity(&self.provider, material)?;
        self.identity.store(Arc::new(identity));
        tracing::info!("TLS client material reloaded");
        Ok(())
    }

    /// Name to present and verify for a connection to `host`.
    pub(crate) fn server_name(&self, host: &str) -> Result<ServerName<'static>, TlsError> {
        match &self.server_name {
            Some(name) => Ok(name.clone()),
            None => parse_server_name(host),
        }
    }

    pub(crate) fn connector(&self, session: SessionId, decide: Decide) -> Result<TlsConnector, TlsError> {
        let identity = self.identity.load();
        let verifier = SessionServerVerifier::new(session, Arc::clone(&identity.server_verifier), decide);
        let config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&self.versions)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())?;
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

fn parse_server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_owned()).map_err(|_| TlsError::ServerName(name.to_owned()))
}

fn build_identity(provider: &Arc<CryptoProvider>, material: TlsMaterial) -> Result<ClientIdentity, TlsError> {
    // Fail at construction rather than on the first connect.
    provider.key_provider.load_private_key(material.key.clone_key())?;
    let server_verifier =
        WebPkiServerVerifier::builder_with_provider(material.roots, Arc::clone(provider)).build()?;
    Ok(ClientIdentity {
        certs: material.certs,
        key: material.key,
        server_verifier,
    })
}
