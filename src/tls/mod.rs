//! TLS adapter over rustls.
//!
//! # Data Flow
//! ```text
//! TlsConfig (paths, versions)
//!     → material.rs (PEM → certs, key, trust roots)
//!     → server.rs / client.rs (per-session rustls config)
//!     → verify.rs (WebPKI pre-verification → per-certificate callback)
//!     → tokio-rustls handshake inside net::listener / net::connector
//! ```
//!
//! # Design Decisions
//! - The crypto provider is passed explicitly, no process-global install
//! - Both sides authenticate: listeners require client certificates
//! - Material is hot-swappable; running handshakes keep what they started with

pub mod client;
pub mod material;
pub mod server;
pub mod verify;

use std::path::PathBuf;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::SupportedProtocolVersion;

use crate::config::TlsConfig;

pub use client::TlsClientContext;
pub use material::TlsMaterial;
pub use server::TlsServerContext;
pub use verify::VerifyContext;

/// Errors building TLS contexts.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed PEM in {what}: {source}")]
    Pem {
        what: &'static str,
        source: std::io::Error,
    },
    #[error("no {0} found in PEM input")]
    MissingPem(&'static str),
    #[error("invalid trust anchor: {0}")]
    TrustAnchor(rustls::Error),
    #[error("invalid server name {0:?}")]
    ServerName(String),
    #[error("no TLS protocol version enabled")]
    NoProtocolVersion,
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

pub(crate) fn default_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub(crate) fn protocol_versions(config: &TlsConfig) -> Result<Vec<&'static SupportedProtocolVersion>, TlsError> {
    let mut versions = Vec::with_capacity(2);
    if config.allow_tls13 {
        versions.push(&rustls::version::TLS13);
    }
    if config.allow_tls12 {
        versions.push(&rustls::version::TLS12);
    }
    if versions.is_empty() {
        return Err(TlsError::NoProtocolVersion);
    }
    Ok(versions)
}
