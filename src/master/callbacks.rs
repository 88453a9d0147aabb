//! Session-layer callbacks for a master accepting outstation connections.

use std::net::IpAddr;

use crate::net::{Channel, SessionId};

/// One certificate of the outstation's chain.
#[derive(Debug, Clone, Copy)]
pub struct CertificateInfo<'a> {
    /// Position in the chain; 0 is the outstation's own certificate.
    pub depth: usize,
    /// DER encoding.
    pub der: &'a [u8],
}

/// Decisions and notifications for sessions accepted by a master listener.
///
/// `accept_connection` and `accept_certificate` run on the shared I/O pool
/// and must not block.
pub trait ListenCallbacks: Send + Sync + 'static {
    /// Accept or reject a connection from `remote` before any handshake.
    fn accept_connection(&self, session: SessionId, remote: IpAddr) -> bool;

    /// Accept or reject one certificate that already passed chain
    /// verification against the trust roots.
    fn accept_certificate(&self, _session: SessionId, _info: &CertificateInfo<'_>) -> bool {
        true
    }

    /// A session is established; the callee owns `channel`.
    fn on_session_established(&self, session: SessionId, channel: Channel);

    /// The channel of an established session reached `Closed`.
    fn on_connection_close(&self, _session: SessionId) {}
}
