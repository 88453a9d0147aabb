//! Per-certificate verification hooks.
//!
//! rustls verifies a peer chain in one call. These verifiers run the WebPKI
//! verifier first, which yields the pre-verification result, then hand each
//! certificate of the presented chain to the session's decision function.
//!
//! # Chain order
//! Certificates are offered root-to-leaf: highest depth first, the
//! end-entity certificate last at depth 0. rustls reports one verdict for the
//! whole chain, so every certificate carries the same `preverified` flag. The
//! first `false` stops the walk and fails the handshake.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};

use crate::net::SessionId;

/// One certificate of the peer's chain, as seen by a verification callback.
///
/// Borrowed from the handshake in progress; it cannot be retained past the
/// callback.
#[derive(Debug, Clone, Copy)]
pub struct VerifyContext<'a> {
    /// Whether the chain passed WebPKI verification against the trust roots.
    pub preverified: bool,
    /// Position in the chain; 0 is the end-entity certificate.
    pub depth: usize,
    /// Number of certificates the peer presented.
    pub chain_len: usize,
    /// DER encoding of this certificate.
    pub certificate: &'a CertificateDer<'a>,
}

/// Session-scoped decision function installed into a handshake.
pub(crate) type Decide = Arc<dyn Fn(SessionId, &VerifyContext<'_>) -> bool + Send + Sync>;

pub(crate) fn decider<F>(f: F) -> Decide
where
    F: Fn(SessionId, &VerifyContext<'_>) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

fn decide_chain(
    decide: &Decide,
    session: SessionId,
    preverified: bool,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
) -> bool {
    let chain_len = intermediates.len() + 1;
    (0..chain_len).rev().all(|depth| {
        let certificate = match depth {
            0 => end_entity,
            n => &intermediates[n - 1],
        };
        let ctx = VerifyContext {
            preverified,
            depth,
            chain_len,
            certificate,
        };
        decide(session, &ctx)
    })
}

fn rejected() -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
}

/// Verifies client certificates on the listener side.
pub(crate) struct SessionClientVerifier {
    session: SessionId,
    inner: Arc<dyn ClientCertVerifier>,
    decide: Decide,
}

impl SessionClientVerifier {
    pub(crate) fn new(session: SessionId, inner: Arc<dyn ClientCertVerifier>, decide: Decide) -> Self {
        Self {
            session,
            inner,
            decide,
        }
    }
}

impl std::fmt::Debug for SessionClientVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClientVerifier")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl ClientCertVerifier for SessionClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let preverified = match self.inner.verify_client_cert(end_entity, intermediates, now) {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(session = %self.session, %error, "Client chain failed pre-verification");
                false
            }
        };

        if decide_chain(&self.decide, self.session, preverified, end_entity, intermediates) {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rejected())
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Verifies server certificates on the connector side.
pub(crate) struct SessionServerVerifier {
    session: SessionId,
    inner: Arc<dyn ServerCertVerifier>,
    decide: Decide,
}

impl SessionServerVerifier {
    pub(crate) fn new(session: SessionId, inner: Arc<dyn ServerCertVerifier>, decide: Decide) -> Self {
        Self {
            session,
            inner,
            decide,
        }
    }
}

impl std::fmt::Debug for SessionServerVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServerVerifier")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for SessionServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let preverified = match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(session = %self.session, %error, "Server chain failed pre-verification");
                false
            }
        };

        if decide_chain(&self.decide, self.session, preverified, end_entity, intermediates) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rejected())
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
