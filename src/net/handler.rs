//! Interfaces between the channel layer and the session layer above it.
//!
//! The listener and connector call into these traits from the shared worker
//! pool. `accept_connection` and `verify_certificate` run inline on the I/O
//! completion path of every session: implementations must return promptly,
//! without blocking I/O or contended locks. Atomic counters are fine.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::executor::Strand;
use crate::lifecycle::Resource;
use crate::net::channel::Channel;
use crate::net::session::SessionId;
use crate::tls::VerifyContext;

/// Decisions and hand-off for inbound sessions.
pub trait ServerHandler: Send + Sync + 'static {
    /// Accept or reject a raw connection. `false` closes the socket with no
    /// further callbacks for `session`.
    fn accept_connection(&self, session: SessionId, remote: SocketAddr) -> bool;

    /// Called once per certificate of the client's chain, root first.
    /// Any `false` fails the handshake.
    fn verify_certificate(&self, _session: SessionId, ctx: &VerifyContext<'_>) -> bool {
        ctx.preverified
    }

    /// Receive an established channel. Called at most once per session, after
    /// every decision for it returned `true`. The handler owns the channel from
    /// here on.
    fn accept_stream(&self, session: SessionId, strand: Strand, channel: Channel);

    /// The listener was stopped, either directly or by the manager sweep.
    fn on_shutdown(&self, _listener: Arc<dyn Resource>) {}
}

/// Decisions and hand-off for outbound sessions.
pub trait ClientHandler: Send + Sync + 'static {
    /// Called once per certificate of the server's chain, root first.
    fn verify_certificate(&self, _session: SessionId, ctx: &VerifyContext<'_>) -> bool {
        ctx.preverified
    }

    /// Receive an established channel, exactly like
    /// [`ServerHandler::accept_stream`].
    fn accept_stream(&self, session: SessionId, strand: Strand, channel: Channel);
}
