//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};

use dnp3_channel::config::{ConnectorConfig, ListenerConfig, TlsConfig};
use dnp3_channel::lifecycle::Resource;
use dnp3_channel::net::{Channel, ClientHandler, ServerHandler, SessionId};
use dnp3_channel::tls::{TlsClientContext, TlsMaterial, TlsServerContext, VerifyContext};
use dnp3_channel::Strand;

/// PEM-encoded certificate chain and private key.
#[derive(Clone)]
pub struct Identity {
    pub chain_pem: String,
    pub key_pem: String,
    pub leaf_der: Vec<u8>,
}

/// A certificate authority able to issue test identities.
pub struct TestCa {
    pub cert_pem: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            cert_pem: cert.pem(),
            cert,
            key,
        }
    }

    pub fn issue(&self, name: &str, purpose: ExtendedKeyUsagePurpose) -> Identity {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![purpose];
        params.subject_alt_names = vec![
            SanType::DnsName("localhost".try_into().unwrap()),
            SanType::IpAddress(Ipv4Addr::LOCALHOST.into()),
        ];

        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        Identity {
            chain_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            leaf_der: cert.der().to_vec(),
        }
    }

    /// Same identity, but the CA certificate is sent along with the leaf.
    pub fn with_ca_in_chain(&self, identity: &Identity) -> Identity {
        Identity {
            chain_pem: format!("{}{}", identity.chain_pem, self.cert_pem),
            ..identity.clone()
        }
    }
}

/// CA, outstation-facing server identity and two client identities.
pub struct TestPki {
    pub ca: TestCa,
    pub server: Identity,
    pub client: Identity,
    /// Trusted by the CA, but rejected by handlers that know its DER.
    pub blocked_client: Identity,
}

impl TestPki {
    pub fn new() -> Self {
        let ca = TestCa::new("dnp3 test ca");
        let server = ca.issue("master", ExtendedKeyUsagePurpose::ServerAuth);
        let client = ca.issue("outstation", ExtendedKeyUsagePurpose::ClientAuth);
        let blocked_client = ca.issue("blocked outstation", ExtendedKeyUsagePurpose::ClientAuth);
        Self {
            ca,
            server,
            client,
            blocked_client,
        }
    }

    pub fn material(&self, identity: &Identity) -> TlsMaterial {
        material(identity, &self.ca.cert_pem)
    }

    pub fn server_context(&self) -> TlsServerContext {
        TlsServerContext::new(self.material(&self.server), &TlsConfig::default()).unwrap()
    }

    pub fn client_context(&self, identity: &Identity) -> TlsClientContext {
        TlsClientContext::new(self.material(identity), &TlsConfig::default()).unwrap()
    }
}

pub fn material(identity: &Identity, trusted_ca_pem: &str) -> TlsMaterial {
    TlsMaterial::from_pem(
        identity.chain_pem.as_bytes(),
        identity.key_pem.as_bytes(),
        trusted_ca_pem.as_bytes(),
    )
    .unwrap()
}

pub fn listener_config() -> ListenerConfig {
    ListenerConfig {
        name: "test".into(),
        bind_address: "127.0.0.1:0".into(),
        handshake_timeout_ms: 5_000,
        ..ListenerConfig::default()
    }
}

pub fn connector_config() -> ConnectorConfig {
    ConnectorConfig {
        name: "test".into(),
        connect_timeout_ms: 5_000,
        handshake_timeout_ms: 5_000,
        ..ConnectorConfig::default()
    }
}

/// Server handler that records every decision and hand-off.
#[derive(Default)]
pub struct RecordingServer {
    pub reject_connections: AtomicBool,
    /// Leaf certificates refused by `verify_certificate`.
    pub blocked: Mutex<HashSet<Vec<u8>>>,
    /// Keep handed-off channels; otherwise they are dropped (and closed).
    pub keep_channels: AtomicBool,

    pub connections: AtomicUsize,
    /// Every verification verdict, per session.
    pub verdicts: DashMap<SessionId, Vec<bool>>,
    pub connection_verdicts: DashMap<SessionId, bool>,
    pub streams: Mutex<Vec<SessionId>>,
    pub channels: Mutex<Vec<Channel>>,
    pub rejected_sessions: AtomicUsize,
    pub shutdowns: AtomicUsize,
    /// Longest time spent inside a decision callback, in nanoseconds.
    pub slowest_decision_ns: AtomicU64,
}

impl RecordingServer {
    pub fn keeping_channels() -> Self {
        let server = Self::default();
        server.keep_channels.store(true, Ordering::SeqCst);
        server
    }

    pub fn block(&self, identity: &Identity) {
        self.blocked.lock().unwrap().insert(identity.leaf_der.clone());
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    fn timed<T>(&self, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed().as_nanos() as u64;
        self.slowest_decision_ns.fetch_max(elapsed, Ordering::Relaxed);
        result
    }
}

impl ServerHandler for RecordingServer {
    fn accept_connection(&self, session: SessionId, _remote: SocketAddr) -> bool {
        self.timed(|| {
            self.connections.fetch_add(1, Ordering::SeqCst);
            let accept = !self.reject_connections.load(Ordering::SeqCst);
            self.connection_verdicts.insert(session, accept);
            accept
        })
    }

    fn verify_certificate(&self, session: SessionId, ctx: &VerifyContext<'_>) -> bool {
        self.timed(|| {
            let verdict = ctx.preverified
                && !(ctx.depth == 0
                    && self
                        .blocked
                        .lock()
                        .unwrap()
                        .contains(ctx.certificate.as_ref()));
            self.verdicts.entry(session).or_default().push(verdict);
            if !verdict {
                self.rejected_sessions.fetch_add(1, Ordering::SeqCst);
            }
            verdict
        })
    }

    fn accept_stream(&self, session: SessionId, _strand: Strand, channel: Channel) {
        self.streams.lock().unwrap().push(session);
        if self.keep_channels.load(Ordering::SeqCst) {
            self.channels.lock().unwrap().push(channel);
        }
    }

    fn on_shutdown(&self, _listener: Arc<dyn Resource>) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Client handler that records hand-offs.
#[derive(Default)]
pub struct RecordingClient {
    pub reject_server: AtomicBool,
    pub verified_depths: Mutex<Vec<usize>>,
    pub streams: Mutex<Vec<(SessionId, Channel)>>,
    pub keep_channels: bool,
}

impl RecordingClient {
    pub fn keeping_channels() -> Self {
        Self {
            keep_channels: true,
            ..Self::default()
        }
    }
}

impl ClientHandler for RecordingClient {
    fn verify_certificate(&self, _session: SessionId, ctx: &VerifyContext<'_>) -> bool {
        self.verified_depths.lock().unwrap().push(ctx.depth);
        ctx.preverified && !self.reject_server.load(Ordering::SeqCst)
    }

    fn accept_stream(&self, session: SessionId, _strand: Strand, channel: Channel) {
        if self.keep_channels {
            self.streams.lock().unwrap().push((session, channel));
        }
    }
}

/// Poll `condition` until it holds, failing the test after `timeout`.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
