//! Plain TCP listener lifecycle: rejection, hand-off and coordinated teardown.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{connector_config, listener_config, RecordingClient, RecordingServer};
use dnp3_channel::net::{ChannelError, ChannelState, Connector, Listener, ListenerState};
use dnp3_channel::ResourceManager;

const WAIT: Duration = Duration::from_secs(10);

async fn plain_listener(handler: Arc<RecordingServer>, manager: &ResourceManager) -> Arc<Listener> {
    let listener = Listener::bind(listener_config(), None, handler, manager.clone())
        .await
        .unwrap();
    listener.start();
    listener
}

#[tokio::test]
async fn rejected_connection_gets_no_channel() {
    let manager = ResourceManager::new();
    let server = Arc::new(RecordingServer::default());
    server.reject_connections.store(true, Ordering::SeqCst);
    let listener = plain_listener(server.clone(), &manager).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    common::wait_until(WAIT, || server.connections.load(Ordering::SeqCst) == 1).await;

    // The server side is simply closed.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(WAIT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    assert_eq!(server.stream_count(), 0);
    assert!(server.verdicts.is_empty());
    assert_eq!(listener.pending_sessions(), 0);
    common::wait_until(WAIT, || listener.available_permits() == listener.max_connections()).await;
    // Only the listener itself is registered.
    assert_eq!(manager.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_all_tears_down_listener_and_channels() {
    let manager = ResourceManager::new();
    let server = Arc::new(RecordingServer::keeping_channels());
    let listener = plain_listener(server.clone(), &manager).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(listener.local_addr()).await.unwrap());
    }
    common::wait_until(WAIT, || server.stream_count() == 3).await;
    assert_eq!(manager.len(), 4);

    manager.shutdown_all();
    manager.shutdown_all();

    assert_eq!(listener.state(), ListenerState::Stopped);
    assert!(manager.is_empty());
    common::wait_until(WAIT, || server.shutdowns.load(Ordering::SeqCst) == 1).await;

    let channels = server.channels.lock().unwrap().clone();
    for channel in &channels {
        tokio::time::timeout(WAIT, channel.closed()).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(channel.write(&b"late"[..]).await, Err(ChannelError::Shutdown)));
        assert!(matches!(channel.read(1).await, Err(ChannelError::Shutdown)));
    }

    // Peers see the close.
    for client in &mut clients {
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, client.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    // The socket is gone once the accept loop has exited.
    let addr = listener.local_addr();
    tokio::time::timeout(WAIT, async {
        while TcpStream::connect(addr).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Nothing can be created on a closed manager.
    assert!(Listener::bind(listener_config(), None, server.clone(), manager.clone())
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connector_and_listener_exchange_bytes() {
    let manager = ResourceManager::new();
    let server = Arc::new(RecordingServer::keeping_channels());
    let listener = plain_listener(server.clone(), &manager).await;

    let client = Arc::new(RecordingClient::keeping_channels());
    let connector = Connector::new(connector_config(), None, client.clone(), manager.clone()).unwrap();
    connector
        .connect(&listener.local_addr().to_string())
        .await
        .unwrap();

    common::wait_until(WAIT, || server.stream_count() == 1).await;
    let inbound = server.channels.lock().unwrap()[0].clone();
    let (_, outbound) = client.streams.lock().unwrap()[0].clone();

    for frame in [&b"first"[..], &b"second"[..]] {
        outbound.write(frame).await.unwrap();
        let mut received = Vec::new();
        while received.len() < frame.len() {
            received.extend_from_slice(&inbound.read(frame.len() - received.len()).await.unwrap());
        }
        assert_eq!(received, frame);
    }

    outbound.shutdown();
    assert!(matches!(inbound.read(8).await, Err(ChannelError::Eof)));
    tokio::time::timeout(WAIT, inbound.closed()).await.unwrap();
}

#[tokio::test]
async fn stopped_listener_leaves_handed_off_channels_alone() {
    let manager = ResourceManager::new();
    let server = Arc::new(RecordingServer::keeping_channels());
    let listener = plain_listener(server.clone(), &manager).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    common::wait_until(WAIT, || server.stream_count() == 1).await;

    listener.stop();
    common::wait_until(WAIT, || server.shutdowns.load(Ordering::SeqCst) == 1).await;

    // The upper layer owns the channel; stopping the listener does not close it.
    let channel = server.channels.lock().unwrap()[0].clone();
    assert!(channel.is_open());
    client.write_all(b"still here").await.unwrap();
    let data = channel.read(64).await.unwrap();
    assert_eq!(&data[..], b"still here");
}
