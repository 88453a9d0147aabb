//! Outbound connections.
//!
//! # Data Flow
//! ```text
//! connect(remote)
//!     → resolve (lookup_host) → TCP connect, bounded by connect_timeout
//!     → [TLS] handshake with per-certificate verification
//!     → Channel on a fresh strand → ClientHandler::accept_stream
//! ```
//!
//! A failed attempt returns `ConnectError` and leaves nothing behind.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::ConnectorConfig;
use crate::executor::Strand;
use crate::lifecycle::{RegistrationHandle, Resource, ResourceManager};
use crate::net::channel::{Channel, ChannelError, ChannelKind, ChannelSetup};
use crate::net::handler::ClientHandler;
use crate::net::session::SessionId;
use crate::observability::metrics;
use crate::tls::verify::{decider, Decide};
use crate::tls::{TlsClientContext, TlsError, TlsMaterial};

/// Error returned by [`Connector::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        source: std::io::Error,
    },
    #[error("{0} did not resolve to any address")]
    NoAddress(String),
    #[error("connection to {address} failed: {source}")]
    Connect {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[error("connection to {0} timed out")]
    Timeout(SocketAddr),
    #[error("TLS handshake with {address} failed: {source}")]
    Handshake {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("connector is shut down")]
    Shutdown,
    #[error("resource manager is shutting down")]
    ManagerClosed,
    #[error("connector does not use TLS")]
    NotTls,
}

enum Transport {
    Plain,
    Tls(TlsClientContext),
}

/// Initiates sessions and hands the established channels to a
/// [`ClientHandler`].
pub struct Connector {
    name: String,
    remote_address: String,
    transport: Transport,
    handler: Arc<dyn ClientHandler>,
    manager: ResourceManager,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    shutdown: watch::Sender<bool>,
    registration: Mutex<Option<RegistrationHandle>>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.name)
            .field("remote_address", &self.remote_address)
            .field("shut_down", &*self.shutdown.borrow())
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Create a connector and register it with `manager`. TLS when `tls` is
    /// given.
    pub fn new(
        config: ConnectorConfig,
        tls: Option<TlsClientContext>,
        handler: Arc<dyn ClientHandler>,
        manager: ResourceManager,
    ) -> Result<Arc<Self>, ConnectError> {
        let transport = match tls {
            Some(context) => Transport::Tls(context),
            None => Transport::Plain,
        };
        let connector = Arc::new(Connector {
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            name: config.name,
            remote_address: config.remote_address,
            transport,
            handler,
            manager: manager.clone(),
            shutdown: watch::channel(false).0,
            registration: Mutex::new(None),
        });

        let registration = manager
            .register(&connector)
            .map_err(|_| ConnectError::ManagerClosed)?;
        *connector
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(registration);
        Ok(connector)
    }

    /// Create from configuration, loading TLS material if configured.
    pub fn from_config(
        config: ConnectorConfig,
        handler: Arc<dyn ClientHandler>,
        manager: ResourceManager,
    ) -> Result<Arc<Self>, ConnectError> {
        let tls = config
            .tls
            .as_ref()
            .map(TlsClientContext::from_config)
            .transpose()?;
        Self::new(config, tls, handler, manager)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the connector has been shut down.
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Connect to the configured remote address.
    pub async fn connect_default(&self) -> Result<SessionId, ConnectError> {
        let remote = self.remote_address.clone();
        self.connect(&remote).await
    }

    /// Connect to `remote` ("host:port"), hand the channel to the handler and
    /// return the session it was established under.
    pub async fn connect(&self, remote: &str) -> Result<SessionId, ConnectError> {
        let session = SessionId::next();
        let result = self.establish(session, remote).await;
        if let Err(error) = &result {
            metrics::record_connect_failure(&self.name);
            tracing::warn!(connector = %self.name, %session, remote, %error, "Connect failed");
        }
        result
    }

    /// Swap the TLS identity and trust roots for subsequent connects.
    pub fn reload_tls(&self, material: TlsMaterial) -> Result<(), ConnectError> {
        match &self.transport {
            Transport::Tls(context) => Ok(context.reload(material)?),
            Transport::Plain => Err(ConnectError::NotTls),
        }
    }

    async fn establish(&self, session: SessionId, remote: &str) -> Result<SessionId, ConnectError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(ConnectError::Shutdown);
        }

        let addresses = tokio::select! {
            biased;
            _ = shut_down(&mut shutdown) => return Err(ConnectError::Shutdown),
            resolved = resolve(remote) => resolved?,
        };

        let (stream, address) = tokio::select! {
            biased;
            _ = shut_down(&mut shutdown) => return Err(ConnectError::Shutdown),
            connected = connect_any(&addresses, self.connect_timeout) => connected?,
        };
        if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(%session, %error, "Failed to set TCP_NODELAY");
        }
        tracing::debug!(connector = %self.name, %session, peer = %address, "TCP connected");

        let kind = match self.transport {
            Transport::Plain => ChannelKind::Tcp,
            Transport::Tls(_) => ChannelKind::Tls,
        };
        let setup = ChannelSetup::new(session, kind, Strand::new(Handle::current())).peer_addr(address);

        let opened = match &self.transport {
            Transport::Plain => Channel::open(stream, setup, &self.manager),
            Transport::Tls(context) => {
                let host = remote.rsplit_once(':').map_or(remote, |(host, _)| host);
                let server_name = context.server_name(host.trim_start_matches('[').trim_end_matches(']'))?;
                let connector = context.connector(session, self.decide())?;
                let handshake = tokio::select! {
                    biased;
                    _ = shut_down(&mut shutdown) => return Err(ConnectError::Shutdown),
                    handshake = tokio::time::timeout(self.handshake_timeout, connector.connect(server_name, stream)) => handshake,
                };
                match handshake {
                    Ok(Ok(tls_stream)) => Channel::open(tls_stream, setup, &self.manager),
                    Ok(Err(source)) => return Err(ConnectError::Handshake { address, source }),
                    Err(_) => return Err(ConnectError::Timeout(address)),
                }
            }
        };

        let channel = opened.map_err(|error| match error {
            ChannelError::ManagerClosed => ConnectError::ManagerClosed,
            _ => ConnectError::Shutdown,
        })?;

        if self.is_shut_down() {
            channel.shutdown();
            return Err(ConnectError::Shutdown);
        }

        tracing::info!(connector = %self.name, %session, peer = %address, kind = %kind, "Session established");
        let strand = channel.strand().clone();
        self.handler.accept_stream(session, strand, channel);
        Ok(session)
    }

    fn decide(&self) -> Decide {
        let handler = Arc::clone(&self.handler);
        decider(move |session, ctx| handler.verify_certificate(session, ctx))
    }
}

impl Resource for Connector {
    /// Abort connects in progress and refuse new ones.
    fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        drop(
            self.registration
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        tracing::info!(connector = %self.name, "Connector shut down");
    }
}

async fn shut_down(state: &mut watch::Receiver<bool>) {
    let _ = state.wait_for(|down| *down).await;
}

async fn resolve(remote: &str) -> Result<Vec<SocketAddr>, ConnectError> {
    let addresses: Vec<SocketAddr> = tokio::net::lookup_host(remote)
        .await
        .map_err(|source| ConnectError::Resolve {
            address: remote.to_owned(),
            source,
        })?
        .collect();
    if addresses.is_empty() {
        return Err(ConnectError::NoAddress(remote.to_owned()));
    }
    Ok(addresses)
}

/// Try each resolved address in order; `timeout` bounds the whole attempt.
/// The error is the one from the last address tried.
async fn connect_any(
    addresses: &[SocketAddr],
    timeout: Duration,
) -> Result<(TcpStream, SocketAddr), ConnectError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_error = None;
    for &address in addresses {
        match tokio::time::timeout_at(deadline, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => return Ok((stream, address)),
            Ok(Err(source)) => {
                tracing::debug!(peer = %address, error = %source, "Address unreachable, trying next");
                last_error = Some(ConnectError::Connect { address, source });
            }
            Err(_) => return Err(ConnectError::Timeout(address)),
        }
    }
    Err(last_error.unwrap_or_else(|| ConnectError::NoAddress(String::new())))
}
