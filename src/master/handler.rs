//! Adapts [`ListenCallbacks`] to the listener's [`ServerHandler`] interface.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::executor::Strand;
use crate::lifecycle::Resource;
use crate::master::callbacks::{CertificateInfo, ListenCallbacks};
use crate::net::{Channel, ServerHandler, SessionId};
use crate::tls::VerifyContext;

/// Server handler for a master that accepts outstation sessions.
pub struct MasterServerHandler {
    callbacks: Arc<dyn ListenCallbacks>,
}

impl MasterServerHandler {
    pub fn new(callbacks: Arc<dyn ListenCallbacks>) -> Arc<Self> {
        Arc::new(Self { callbacks })
    }
}

impl ServerHandler for MasterServerHandler {
    fn accept_connection(&self, session: SessionId, remote: SocketAddr) -> bool {
        let accepted = self.callbacks.accept_connection(session, remote.ip());
        if accepted {
            tracing::info!(%session, peer = %remote, "Accepted connection");
        } else {
            tracing::info!(%session, peer = %remote, "Rejected connection");
        }
        accepted
    }

    fn verify_certificate(&self, session: SessionId, ctx: &VerifyContext<'_>) -> bool {
        // Trust-root failures are final; the callbacks only narrow further.
        if !ctx.preverified {
            tracing::warn!(%session, depth = ctx.depth, "Certificate failed chain verification");
            return false;
        }

        let info = CertificateInfo {
            depth: ctx.depth,
            der: ctx.certificate.as_ref(),
        };
        let accepted = self.callbacks.accept_certificate(session, &info);
        if !accepted {
            tracing::info!(%session, depth = ctx.depth, "Certificate rejected by callbacks");
        }
        accepted
    }

    fn accept_stream(&self, session: SessionId, strand: Strand, channel: Channel) {
        let callbacks = Arc::clone(&self.callbacks);
        let closed = channel.on_closed();
        strand.handle().spawn(async move {
            closed.await;
            tracing::info!(%session, "Session closed");
            callbacks.on_connection_close(session);
        });

        self.callbacks.on_session_established(session, channel);
    }

    fn on_shutdown(&self, _listener: Arc<dyn Resource>) {
        tracing::info!("Master listener shut down");
    }
}
