//! TCP and TLS listener with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections and assign a `SessionId` to each
//! - Enforce max_connections limit via semaphore
//! - Run the accept decision, the TLS handshake and per-certificate
//!   verification, then hand the established `Channel` to the handler
//! - Stop exactly once, from the owner or the `ResourceManager` sweep
//!
//! # State Machine
//! ```text
//! Bound ──start()──▶ Listening ──stop() / manager sweep──▶ Stopped
//!   └───────────────────stop()──────────────────────────────▲
//! ```
//!
//! # Design Decisions
//! - Plain and TLS listeners share one accept loop; the transport is a tagged
//!   variant chosen at construction
//! - Handshakes run on their own tasks so a slow peer never delays accepts
//! - Stop abandons handshakes still in progress; channels that finished
//!   their handshake after stop are shut down instead of handed off

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;
use crate::executor::Strand;
use crate::lifecycle::{RegistrationHandle, Resource, ResourceManager};
use crate::net::channel::{Channel, ChannelError, ChannelKind, ChannelSetup};
use crate::net::handler::ServerHandler;
use crate::net::session::SessionId;
use crate::observability::metrics;
use crate::tls::verify::{decider, Decide};
use crate::tls::{TlsError, TlsMaterial, TlsServerContext};

/// Pause after a failed `accept()` (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    Bind(std::io::Error),
    /// The resource manager is already tearing the stack down.
    #[error("resource manager is shutting down")]
    ManagerClosed,
    /// TLS material could not be loaded or applied.
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// TLS operation on a plain TCP listener.
    #[error("listener does not use TLS")]
    NotTls,
}

/// Lifecycle state of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Socket bound, accept loop not started.
    Bound,
    /// Accepting connections.
    Listening,
    /// No further accepts will be scheduled.
    Stopped,
}

enum Transport {
    Plain,
    Tls(TlsServerContext),
}

impl Transport {
    fn kind(&self) -> ChannelKind {
        match self {
            Transport::Plain => ChannelKind::Tcp,
            Transport::Tls(_) => ChannelKind::Tls,
        }
    }
}

/// A bounded listener that turns accepted sockets into channels.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections wait in the kernel backlog until a channel closes.
pub struct Listener {
    name: String,
    local_addr: SocketAddr,
    /// Taken by the accept loop on start, or dropped on stop.
    socket: Mutex<Option<TcpListener>>,
    transport: Transport,
    handler: Arc<dyn ServerHandler>,
    manager: ResourceManager,
    connection_limit: Arc<Semaphore>,
    /// Set while the accept loop holds a permit for a connection not yet
    /// accepted. That slot is still free.
    accept_reserved: AtomicBool,
    max_connections: usize,
    handshake_timeout: Duration,
    state: watch::Sender<ListenerState>,
    /// Sessions accepted but not yet handed off or torn down.
    pending: DashMap<SessionId, SocketAddr>,
    /// Set by `stop`; paired with `handoffs` so no hand-off starts after
    /// `on_shutdown` and `on_shutdown` waits for hand-offs already running.
    stopping: AtomicBool,
    handoffs: AtomicUsize,
    shutdown_notified: AtomicBool,
    registration: Mutex<Option<RegistrationHandle>>,
    weak_self: Weak<Listener>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("kind", &self.transport.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Listener {
    /// Bind to the configured address and register with `manager`.
    ///
    /// The listener is TLS when `tls` is given. Nothing is accepted until
    /// [`Listener::start`].
    pub async fn bind(
        config: ListenerConfig,
        tls: Option<TlsServerContext>,
        handler: Arc<dyn ServerHandler>,
        manager: ResourceManager,
    ) -> Result<Arc<Self>, ListenerError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        let socket = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        let local_addr = socket.local_addr().map_err(ListenerError::Bind)?;

        let transport = match tls {
            Some(context) => Transport::Tls(context),
            None => Transport::Plain,
        };
        let (state, _) = watch::channel(ListenerState::Bound);

        let listener = Arc::new_cyclic(|weak_self| Listener {
            name: config.name.clone(),
            local_addr,
            socket: Mutex::new(Some(socket)),
            transport,
            handler,
            manager: manager.clone(),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            accept_reserved: AtomicBool::new(false),
            max_connections: config.max_connections,
            handshake_timeout: config.handshake_timeout(),
            state,
            pending: DashMap::new(),
            stopping: AtomicBool::new(false),
            handoffs: AtomicUsize::new(0),
            shutdown_notified: AtomicBool::new(false),
            registration: Mutex::new(None),
            weak_self: weak_self.clone(),
        });

        // On failure the listener is dropped here, closing the socket.
        let registration = manager
            .register(&listener)
            .map_err(|_| ListenerError::ManagerClosed)?;
        *listener
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(registration);

        tracing::info!(
            listener = %listener.name,
            address = %local_addr,
            kind = %listener.transport.kind(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(listener)
    }

    /// Bind using the TLS section of `config`, if any.
    pub async fn from_config(
        config: ListenerConfig,
        handler: Arc<dyn ServerHandler>,
        manager: ResourceManager,
    ) -> Result<Arc<Self>, ListenerError> {
        let tls = config
            .tls
            .as_ref()
            .map(TlsServerContext::from_config)
            .transpose()?;
        Self::bind(config, tls, handler, manager).await
    }

    /// Begin accepting. Idempotent; does nothing once stopped.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let started = self.state.send_if_modified(|state| {
            if *state == ListenerState::Bound {
                *state = ListenerState::Listening;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(socket) = socket {
            tokio::spawn(Arc::clone(self).accept_loop(socket));
            tracing::info!(listener = %self.name, address = %self.local_addr, "Listening for connections");
        }
    }

    /// Stop accepting and abandon handshakes in progress. Idempotent.
    ///
    /// The first call unregisters the listener and notifies
    /// [`ServerHandler::on_shutdown`]. A hand-off already inside
    /// [`ServerHandler::accept_stream`] finishes first; the notification then
    /// comes from that session's task.
    pub fn stop(&self) {
        let stopped = self.state.send_if_modified(|state| {
            if *state != ListenerState::Stopped {
                *state = ListenerState::Stopped;
                true
            } else {
                false
            }
        });
        if !stopped {
            return;
        }
        self.stopping.store(true, Ordering::SeqCst);

        // Never started: close the socket now.
        drop(self.socket.lock().unwrap_or_else(PoisonError::into_inner).take());
        drop(
            self.registration
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        tracing::info!(
            listener = %self.name,
            pending_sessions = self.pending.len(),
            "Listener stopped"
        );

        if self.handoffs.load(Ordering::SeqCst) == 0 {
            self.notify_shutdown();
        }
    }

    fn notify_shutdown(&self) {
        if self.shutdown_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(this) = self.weak_self.upgrade() {
            self.handler.on_shutdown(this);
        }
    }

    /// Name from the configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Plain TCP or TLS.
    pub fn kind(&self) -> ChannelKind {
        self.transport.kind()
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Sessions accepted but not yet handed off or torn down.
    pub fn pending_sessions(&self) -> usize {
        self.pending.len()
    }

    /// Get current available connection slots.
    ///
    /// The permit held by an idle accept loop counts as available.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
            + usize::from(self.accept_reserved.load(Ordering::Acquire))
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Swap the TLS identity and trust roots for subsequent sessions.
    pub fn reload_tls(&self, material: TlsMaterial) -> Result<(), ListenerError> {
        match &self.transport {
            Transport::Tls(context) => Ok(context.reload(material)?),
            Transport::Plain => Err(ListenerError::NotTls),
        }
    }

    async fn accept_loop(self: Arc<Self>, socket: TcpListener) {
        let mut state = self.state.subscribe();
        loop {
            // Acquire permit first (backpressure)
            let permit = tokio::select! {
                biased;
                _ = stopped(&mut state) => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.accept_reserved.store(true, Ordering::Release);
            let accepted = tokio::select! {
                biased;
                _ = stopped(&mut state) => None,
                accepted = socket.accept() => Some(accepted),
            };
            self.accept_reserved.store(false, Ordering::Release);

            let (stream, remote) = match accepted {
                Some(Ok(accepted)) => accepted,
                Some(Err(error)) => {
                    tracing::warn!(listener = %self.name, %error, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
                None => break,
            };

            let session = SessionId::next();
            if !self.handler.accept_connection(session, remote) {
                tracing::debug!(listener = %self.name, %session, peer = %remote, "Connection rejected");
                metrics::record_session_rejected(&self.name, "connection");
                continue;
            }

            tracing::debug!(
                listener = %self.name,
                %session,
                peer = %remote,
                available_permits = self.available_permits(),
                "Connection accepted"
            );

            self.pending.insert(session, remote);
            let listener = Arc::clone(&self);
            tokio::spawn(async move {
                let permit = ConnectionPermit { _permit: permit };
                if let Err(reason) = listener.establish(session, stream, remote, permit).await {
                    metrics::record_session_rejected(&listener.name, reason);
                }
                listener.pending.remove(&session);
            });
        }

        tracing::debug!(listener = %self.name, "Accept loop exited");
    }

    /// Handshake, open the channel and hand it off. The error is the
    /// rejection reason recorded in metrics.
    async fn establish(
        &self,
        session: SessionId,
        stream: TcpStream,
        remote: SocketAddr,
        permit: ConnectionPermit,
    ) -> Result<(), &'static str> {
        if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(%session, %error, "Failed to set TCP_NODELAY");
        }

        let setup = ChannelSetup::new(session, self.transport.kind(), Strand::new(Handle::current()))
            .peer_addr(remote)
            .permit(permit);

        let opened = match &self.transport {
            Transport::Plain => Channel::open(stream, setup, &self.manager),
            Transport::Tls(context) => {
                let acceptor = context.acceptor(session, self.decide()).map_err(|error| {
                    tracing::warn!(listener = %self.name, %session, %error, "TLS setup failed");
                    "handshake"
                })?;

                let started = Instant::now();
                let mut state = self.state.subscribe();
                let handshake = tokio::select! {
                    biased;
                    _ = stopped(&mut state) => {
                        tracing::debug!(%session, "Handshake abandoned, listener stopped");
                        return Err("stopped");
                    }
                    handshake = tokio::time::timeout(self.handshake_timeout, acceptor.accept(stream)) => handshake,
                };

                match handshake {
                    Ok(Ok(tls_stream)) => {
                        metrics::record_handshake_duration(&self.name, started.elapsed());
                        Channel::open(tls_stream, setup, &self.manager)
                    }
                    Ok(Err(error)) => {
                        let reason = handshake_failure_reason(&error);
                        tracing::debug!(listener = %self.name, %session, peer = %remote, %error, reason, "Handshake failed");
                        return Err(reason);
                    }
                    Err(_) => {
                        tracing::debug!(listener = %self.name, %session, peer = %remote, "Handshake timed out");
                        return Err("timeout");
                    }
                }
            }
        };

        let channel = match opened {
            Ok(channel) => channel,
            Err(ChannelError::ManagerClosed) => return Err("manager_closed"),
            Err(error) => {
                tracing::debug!(%session, %error, "Channel setup failed");
                return Err("handshake");
            }
        };

        self.handoffs.fetch_add(1, Ordering::SeqCst);
        let outcome = if self.stopping.load(Ordering::SeqCst) {
            tracing::debug!(%session, "Listener stopped before hand-off");
            channel.shutdown();
            Err("stopped")
        } else {
            metrics::record_session_accepted(&self.name);
            tracing::info!(
                listener = %self.name,
                %session,
                peer = %remote,
                kind = %channel.kind(),
                "Session established"
            );
            let strand = channel.strand().clone();
            self.handler.accept_stream(session, strand, channel);
            Ok(())
        };
        if self.handoffs.fetch_sub(1, Ordering::SeqCst) == 1 && self.stopping.load(Ordering::SeqCst) {
            self.notify_shutdown();
        }
        outcome
    }

    fn decide(&self) -> Decide {
        let handler = Arc::clone(&self.handler);
        decider(move |session, ctx| handler.verify_certificate(session, ctx))
    }
}

impl Resource for Listener {
    fn shutdown(&self) {
        self.stop();
    }
}

async fn stopped(state: &mut watch::Receiver<ListenerState>) {
    let _ = state.wait_for(|s| *s == ListenerState::Stopped).await;
}

fn handshake_failure_reason(error: &std::io::Error) -> &'static str {
    match error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(rustls::Error::InvalidCertificate(_)) | Some(rustls::Error::NoCertificatesPresented) => {
            "certificate"
        }
        _ => "handshake",
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// The channel holds it until it reaches `Closed`.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
