//! Established byte channels.
//!
//! # Responsibilities
//! - Wrap one plain TCP or TLS stream behind a single interface
//! - Deliver every read/write completion through the channel's strand
//! - Shut down exactly once, from the owner or the `ResourceManager` sweep
//!
//! # State Machine
//! ```text
//! Open ──shutdown() / I/O error / EOF──▶ ShuttingDown ──I/O tasks exited──▶ Closed
//! ```
//!
//! The stream is split into halves owned by one reader task and one writer
//! task. Each task drains a FIFO of operations, so reads complete in
//! submission order, writes complete in submission order, and a pending read
//! never blocks a write.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use crate::executor::Strand;
use crate::lifecycle::{RegistrationHandle, Resource, ResourceManager};
use crate::net::listener::ConnectionPermit;
use crate::net::session::SessionId;
use crate::observability::metrics;

/// Upper bound for the graceful close (TLS close_notify / TCP FIN).
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest buffer a single read allocates, whatever `max_len` asks for.
const MAX_READ_CHUNK: usize = 64 * 1024;

/// Error delivered to read/write completions.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel was shut down before or while the operation ran.
    #[error("channel is shut down")]
    Shutdown,
    /// The peer closed its side of the connection.
    #[error("connection closed by peer")]
    Eof,
    /// The underlying stream failed.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The channel could not be registered because teardown has begun.
    #[error("resource manager is shutting down")]
    ManagerClosed,
}

/// Transport wrapped by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Tcp,
    Tls,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Tcp => f.write_str("tcp"),
            ChannelKind::Tls => f.write_str("tls"),
        }
    }
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Reads and writes are accepted.
    Open,
    /// Shutdown requested; pending operations are failing with `Shutdown`.
    ShuttingDown,
    /// No further completion will be delivered.
    Closed,
}

type ReadCallback = Box<dyn FnOnce(Result<Bytes, ChannelError>) + Send + 'static>;
type WriteCallback = Box<dyn FnOnce(Result<usize, ChannelError>) + Send + 'static>;

struct ReadOp {
    max_len: usize,
    callback: ReadCallback,
}

struct WriteOp {
    data: Bytes,
    callback: WriteCallback,
}

/// Everything needed to open a channel besides the stream itself.
pub(crate) struct ChannelSetup {
    pub(crate) session: SessionId,
    pub(crate) kind: ChannelKind,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) strand: Strand,
    pub(crate) permit: Option<ConnectionPermit>,
}

impl ChannelSetup {
    pub(crate) fn new(session: SessionId, kind: ChannelKind, strand: Strand) -> Self {
        Self {
            session,
            kind,
            peer_addr: None,
            strand,
            permit: None,
        }
    }

    pub(crate) fn peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub(crate) fn permit(mut self, permit: ConnectionPermit) -> Self {
        self.permit = Some(permit);
        self
    }
}

/// State shared by the channel handle and its I/O tasks.
struct Lifecycle {
    session: SessionId,
    strand: Strand,
    state: watch::Sender<ChannelState>,
    io_tasks: AtomicUsize,
    registration: Mutex<Option<RegistrationHandle>>,
    permit: Mutex<Option<ConnectionPermit>>,
}

impl Lifecycle {
    fn is_open(&self) -> bool {
        *self.state.borrow() == ChannelState::Open
    }

    /// Open → ShuttingDown. Returns true only for the call that transitioned.
    fn begin_shutdown(&self) -> bool {
        let first = self.state.send_if_modified(|state| {
            if *state == ChannelState::Open {
                *state = ChannelState::ShuttingDown;
                true
            } else {
                false
            }
        });

        if first {
            let registration = self
                .registration
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            drop(registration);
            tracing::debug!(session = %self.session, "Channel shutting down");
        }
        first
    }

    /// Post `callback(result)` on the strand. A completion that reaches the
    /// strand after shutdown began is rewritten to `Shutdown`.
    fn deliver<T, F>(self: &Arc<Self>, callback: F, result: Result<T, ChannelError>)
    where
        T: Send + 'static,
        F: FnOnce(Result<T, ChannelError>) + Send + 'static,
    {
        let lifecycle = Arc::clone(self);
        let posted = self.strand.post(move || {
            let result = if lifecycle.is_open() {
                result
            } else {
                Err(ChannelError::Shutdown)
            };
            callback(result);
        });
        if posted.is_err() {
            tracing::trace!(session = %self.session, "Completion dropped, strand stopped");
        }
    }

    /// Shut down after any completion already posted for the failing operation.
    fn fail(self: &Arc<Self>) {
        let lifecycle = Arc::clone(self);
        if self
            .strand
            .post(move || {
                lifecycle.begin_shutdown();
            })
            .is_err()
        {
            self.begin_shutdown();
        }
    }

    fn io_task_exited(self: &Arc<Self>) {
        if self.io_tasks.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Posted behind every completion of both tasks: nothing can follow it.
        let lifecycle = Arc::clone(self);
        let close = move || {
            lifecycle.state.send_replace(ChannelState::Closed);
            let permit = lifecycle
                .permit
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            drop(permit);
            metrics::record_channel_closed();
            tracing::debug!(session = %lifecycle.session, "Channel closed");
        };
        if let Err(closed) = self.strand.post(close) {
            tracing::trace!(session = %self.session, error = %closed, "Closing outside strand");
            self.state.send_replace(ChannelState::Closed);
            metrics::record_channel_closed();
        }
    }
}

struct ChannelShared {
    kind: ChannelKind,
    peer_addr: Option<SocketAddr>,
    lifecycle: Arc<Lifecycle>,
    reads: mpsc::UnboundedSender<ReadOp>,
    writes: mpsc::UnboundedSender<WriteOp>,
}

impl Resource for ChannelShared {
    fn shutdown(&self) {
        self.lifecycle.begin_shutdown();
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        self.lifecycle.begin_shutdown();
    }
}

/// An established, bidirectional byte channel bound to one [`Strand`].
///
/// Cloning yields another handle to the same channel. The channel shuts down
/// when [`Channel::shutdown`] is called, when the `ResourceManager` sweeps it,
/// on I/O error, or when the last handle is dropped.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("session", &self.session())
            .field("kind", &self.shared.kind)
            .field("peer_addr", &self.shared.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    /// Wrap `stream`, register with `manager` and start the I/O tasks.
    ///
    /// On `ManagerClosed` the stream has already been dropped.
    pub(crate) fn open<S>(
        stream: S,
        setup: ChannelSetup,
        manager: &ResourceManager,
    ) -> Result<Channel, ChannelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (state, _) = watch::channel(ChannelState::Open);
        let lifecycle = Arc::new(Lifecycle {
            session: setup.session,
            strand: setup.strand,
            state,
            io_tasks: AtomicUsize::new(2),
            registration: Mutex::new(None),
            permit: Mutex::new(setup.permit),
        });
        let (reads, read_rx) = mpsc::unbounded_channel();
        let (writes, write_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared {
            kind: setup.kind,
            peer_addr: setup.peer_addr,
            lifecycle: Arc::clone(&lifecycle),
            reads,
            writes,
        });

        let handle = manager
            .register(&shared)
            .map_err(|_| ChannelError::ManagerClosed)?;
        *lifecycle
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let (reader, writer) = tokio::io::split(stream);
        let runtime = lifecycle.strand.handle().clone();
        runtime.spawn(read_loop(Arc::clone(&lifecycle), reader, read_rx));
        runtime.spawn(write_loop(Arc::clone(&lifecycle), writer, write_rx));

        metrics::record_channel_opened();
        tracing::debug!(
            session = %lifecycle.session,
            kind = %setup.kind,
            peer = ?setup.peer_addr,
            strand = lifecycle.strand.id(),
            "Channel open"
        );

        Ok(Channel { shared })
    }

    /// Session this channel was established for.
    pub fn session(&self) -> SessionId {
        self.shared.lifecycle.session
    }

    /// Plain TCP or TLS.
    pub fn kind(&self) -> ChannelKind {
        self.shared.kind
    }

    /// Remote address, when the channel wraps a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Strand every completion of this channel runs on.
    pub fn strand(&self) -> &Strand {
        &self.shared.lifecycle.strand
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.shared.lifecycle.state.borrow()
    }

    /// Whether new operations can still succeed.
    pub fn is_open(&self) -> bool {
        self.shared.lifecycle.is_open()
    }

    /// Read up to `max_len` bytes; `callback` runs on the strand.
    ///
    /// A single read returns at most 64 KiB, whatever `max_len` is.
    ///
    /// Completes with [`ChannelError::Eof`] when the peer closed the
    /// connection, which also shuts the channel down.
    pub fn begin_read<F>(&self, max_len: usize, callback: F)
    where
        F: FnOnce(Result<Bytes, ChannelError>) + Send + 'static,
    {
        let op = ReadOp {
            max_len,
            callback: Box::new(callback),
        };
        if let Err(mpsc::error::SendError(op)) = self.shared.reads.send(op) {
            self.shared
                .lifecycle
                .deliver(op.callback, Err(ChannelError::Shutdown));
        }
    }

    /// Write all of `data`; `callback` runs on the strand with the byte count.
    pub fn begin_write<F>(&self, data: impl Into<Bytes>, callback: F)
    where
        F: FnOnce(Result<usize, ChannelError>) + Send + 'static,
    {
        let op = WriteOp {
            data: data.into(),
            callback: Box::new(callback),
        };
        if let Err(mpsc::error::SendError(op)) = self.shared.writes.send(op) {
            self.shared
                .lifecycle
                .deliver(op.callback, Err(ChannelError::Shutdown));
        }
    }

    /// Async form of [`Channel::begin_read`].
    pub async fn read(&self, max_len: usize) -> Result<Bytes, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.begin_read(max_len, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(ChannelError::Shutdown))
    }

    /// Async form of [`Channel::begin_write`].
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<usize, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.begin_write(data, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(ChannelError::Shutdown))
    }

    /// Request shutdown. Idempotent; only the first call has an effect.
    pub fn shutdown(&self) {
        self.shared.lifecycle.begin_shutdown();
    }

    /// Wait until the channel reaches [`ChannelState::Closed`].
    pub async fn closed(&self) {
        self.on_closed().await
    }

    /// Like [`Channel::closed`], but the future holds no handle, so it does
    /// not keep the channel open.
    pub fn on_closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.shared.lifecycle.state.subscribe();
        async move {
            let _ = state.wait_for(|s| *s == ChannelState::Closed).await;
        }
    }
}

async fn shutdown_requested(state: &mut watch::Receiver<ChannelState>) {
    let _ = state.wait_for(|s| *s != ChannelState::Open).await;
}

async fn read_loop<R>(
    lifecycle: Arc<Lifecycle>,
    mut reader: R,
    mut ops: mpsc::UnboundedReceiver<ReadOp>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut state = lifecycle.state.subscribe();
    loop {
        let op = tokio::select! {
            biased;
            _ = shutdown_requested(&mut state) => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        if op.max_len == 0 {
            lifecycle.deliver(op.callback, Ok(Bytes::new()));
            continue;
        }

        let mut buf = BytesMut::zeroed(op.max_len.min(MAX_READ_CHUNK));
        let outcome = tokio::select! {
            biased;
            _ = shutdown_requested(&mut state) => Err(ChannelError::Shutdown),
            read = reader.read(&mut buf) => match read {
                Ok(0) => Err(ChannelError::Eof),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(buf.freeze())
                }
                Err(e) => Err(ChannelError::Io(e)),
            },
        };

        let failed = outcome.is_err();
        if let Err(error) = &outcome {
            tracing::debug!(session = %lifecycle.session, %error, "Read failed");
        }
        lifecycle.deliver(op.callback, outcome);
        if failed {
            lifecycle.fail();
            break;
        }
    }

    ops.close();
    while let Ok(op) = ops.try_recv() {
        lifecycle.deliver(op.callback, Err(ChannelError::Shutdown));
    }
    lifecycle.io_task_exited();
}

async fn write_loop<W>(
    lifecycle: Arc<Lifecycle>,
    mut writer: W,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
) where
    W: AsyncWrite + Send + Unpin,
{
    let mut state = lifecycle.state.subscribe();
    loop {
        let op = tokio::select! {
            biased;
            _ = shutdown_requested(&mut state) => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let len = op.data.len();
        let outcome = tokio::select! {
            biased;
            _ = shutdown_requested(&mut state) => Err(ChannelError::Shutdown),
            written = async {
                writer.write_all(&op.data).await?;
                writer.flush().await
            } => written.map(|()| len).map_err(ChannelError::Io),
        };

        let failed = outcome.is_err();
        if let Err(error) = &outcome {
            tracing::debug!(session = %lifecycle.session, %error, "Write failed");
        }
        lifecycle.deliver(op.callback, outcome);
        if failed {
            lifecycle.fail();
            break;
        }
    }

    ops.close();
    while let Ok(op) = ops.try_recv() {
        lifecycle.deliver(op.callback, Err(ChannelError::Shutdown));
    }

    if tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown())
        .await
        .is_err()
    {
        tracing::debug!(session = %lifecycle.session, "Graceful close timed out");
    }
    lifecycle.io_task_exited();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn open_pair(manager: &ResourceManager, buffer: usize) -> (Channel, DuplexStream) {
        let (local, remote) = tokio::io::duplex(buffer);
        let setup = ChannelSetup::new(SessionId::next(), ChannelKind::Tcp, Strand::current());
        let channel = Channel::open(local, setup, manager).unwrap();
        (channel, remote)
    }

    async fn wait_closed(channel: &Channel) {
        tokio::time::timeout(Duration::from_secs(5), channel.closed())
            .await
            .expect("channel did not close");
    }

    #[tokio::test]
    async fn write_and_read_through_peer() {
        let manager = ResourceManager::new();
        let (channel, mut remote) = open_pair(&manager, 1024);

        assert_eq!(channel.write(&b"hello"[..]).await.unwrap(), 5);
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        remote.write_all(b"world").await.unwrap();
        let data = channel.read(16).await.unwrap();
        assert_eq!(&data[..], b"world");
    }

    #[tokio::test]
    async fn completions_arrive_on_strand_in_order() {
        let manager = ResourceManager::new();
        let (channel, mut remote) = open_pair(&manager, 1024);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10u8 {
            let order = order.clone();
            channel.begin_write(vec![i], move |result| {
                assert_eq!(result.unwrap(), 1);
                order.lock().unwrap().push(i);
            });
        }
        let mut buf = [0u8; 10];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf.to_vec(), (0..10).collect::<Vec<u8>>());

        channel.strand().run(|| ()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn pending_read_does_not_block_write() {
        let manager = ResourceManager::new();
        let (channel, mut remote) = open_pair(&manager, 1024);

        let (tx, rx) = oneshot::channel();
        channel.begin_read(8, move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(channel.write(&b"ping"[..]).await.unwrap(), 4);

        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        remote.write_all(b"pong").await.unwrap();
        assert_eq!(&rx.await.unwrap().unwrap()[..], b"pong");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_shutdown_is_idempotent() {
        let manager = ResourceManager::new();
        let (channel, _remote) = open_pair(&manager, 1024);
        assert_eq!(manager.len(), 1);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let channel = channel.clone();
                std::thread::spawn(move || channel.shutdown())
            })
            .collect();
        manager.shutdown_all();
        for thread in threads {
            thread.join().unwrap();
        }

        wait_closed(&channel).await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn shutdown_during_write_reports_shutdown() {
        let manager = ResourceManager::new();
        // Tiny pipe and a peer that never reads: the write stays in flight.
        let (channel, _remote) = open_pair(&manager, 16);

        let (tx, rx) = oneshot::channel();
        channel.begin_write(vec![0u8; 64 * 1024], move |result| {
            let _ = tx.send(result);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Shutdown)));
        wait_closed(&channel).await;
    }

    #[tokio::test]
    async fn operations_after_shutdown_fail() {
        let manager = ResourceManager::new();
        let (channel, _remote) = open_pair(&manager, 1024);
        channel.shutdown();
        wait_closed(&channel).await;

        assert!(matches!(channel.write(&b"late"[..]).await, Err(ChannelError::Shutdown)));
        assert!(matches!(channel.read(4).await, Err(ChannelError::Shutdown)));
    }

    #[tokio::test]
    async fn peer_close_reports_eof_and_shuts_down() {
        let manager = ResourceManager::new();
        let (channel, remote) = open_pair(&manager, 1024);
        drop(remote);

        assert!(matches!(channel.read(8).await, Err(ChannelError::Eof)));
        wait_closed(&channel).await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn oversized_read_is_capped_and_channel_still_closes() {
        let manager = ResourceManager::new();
        let (channel, mut remote) = open_pair(&manager, MAX_READ_CHUNK * 2);

        let payload = vec![0x05u8; MAX_READ_CHUNK + 16];
        remote.write_all(&payload).await.unwrap();
        let first = channel.read(usize::MAX).await.unwrap();
        assert!(!first.is_empty());
        assert!(first.len() <= MAX_READ_CHUNK);

        let (tx, rx) = oneshot::channel();
        channel.begin_read(usize::MAX, move |result| {
            let _ = tx.send(result.map(|data| data.len()));
        });
        let second = rx.await.unwrap().unwrap();
        assert!(second > 0 && second <= MAX_READ_CHUNK);

        channel.shutdown();
        wait_closed(&channel).await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn manager_sweep_reaches_channel() {
        let manager = ResourceManager::new();
        let (channel, _remote) = open_pair(&manager, 1024);

        manager.shutdown_all();
        wait_closed(&channel).await;
        assert!(matches!(channel.write(&b"x"[..]).await, Err(ChannelError::Shutdown)));
    }

    #[tokio::test]
    async fn open_fails_when_manager_closed() {
        let manager = ResourceManager::new();
        manager.shutdown_all();

        let (local, _remote) = tokio::io::duplex(64);
        let setup = ChannelSetup::new(SessionId::next(), ChannelKind::Tcp, Strand::current());
        assert!(matches!(
            Channel::open(local, setup, &manager),
            Err(ChannelError::ManagerClosed)
        ));
    }

    #[tokio::test]
    async fn dropping_last_handle_closes_stream() {
        let manager = ResourceManager::new();
        let (channel, mut remote) = open_pair(&manager, 1024);
        drop(channel);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
        assert!(manager.is_empty());
    }
}
