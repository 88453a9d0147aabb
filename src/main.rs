//! DNP3 channel daemon.
//!
//! Starts every configured listener and connector with an echo session layer and tears the
//! whole stack down on SIGINT/SIGTERM. Useful for loopback and TLS
//! interoperability testing.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use dnp3_channel::config::{load_config, ChannelConfig};
use dnp3_channel::lifecycle::signals::wait_for_termination;
use dnp3_channel::master::{ListenCallbacks, MasterServerHandler};
use dnp3_channel::net::{Channel, ClientHandler, Connector, Listener, SessionId};
use dnp3_channel::observability::{init_logging, init_metrics};
use dnp3_channel::{ResourceManager, Strand};

#[derive(Debug, Parser)]
#[command(name = "dnp3-channel", version, about = "DNP3 TCP/TLS channel daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

/// Accepts every connection and echoes received bytes back.
struct EchoCallbacks;

impl ListenCallbacks for EchoCallbacks {
    fn accept_connection(&self, _session: SessionId, _remote: IpAddr) -> bool {
        true
    }

    fn on_session_established(&self, session: SessionId, channel: Channel) {
        tokio::spawn(echo(session, channel));
    }
}

impl ClientHandler for EchoCallbacks {
    fn accept_stream(&self, session: SessionId, _strand: Strand, channel: Channel) {
        tokio::spawn(echo(session, channel));
    }
}

async fn echo(session: SessionId, channel: Channel) {
    loop {
        let data = match channel.read(4096).await {
            Ok(data) => data,
            Err(error) => {
                tracing::debug!(%session, %error, "Echo session ended");
                break;
            }
        };
        if let Err(error) = channel.write(data).await {
            tracing::debug!(%session, %error, "Echo write failed");
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ChannelConfig::default(),
    };
    if cli.check {
        println!("configuration ok");
        return Ok(());
    }

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "dnp3-channel starting");

    if config.observability.metrics_enabled {
        init_metrics(config.observability.metrics_address.parse()?)?;
    }

    let manager = ResourceManager::new();
    let handler = MasterServerHandler::new(Arc::new(EchoCallbacks));

    let mut listeners = Vec::with_capacity(config.listeners.len());
    for listener_config in config.listeners.clone() {
        let name = listener_config.name.clone();
        match Listener::from_config(listener_config, handler.clone(), manager.clone()).await {
            Ok(listener) => {
                listener.start();
                listeners.push(listener);
            }
            Err(error) => {
                tracing::error!(listener = %name, %error, "Failed to start listener");
                manager.shutdown_all();
                return Err(error.into());
            }
        }
    }
    if listeners.is_empty() && config.connectors.is_empty() {
        tracing::warn!("No listeners or connectors configured");
    }

    let mut connectors = Vec::with_capacity(config.connectors.len());
    for connector_config in config.connectors {
        let connector = Connector::from_config(connector_config, Arc::new(EchoCallbacks), manager.clone())?;
        let outbound = Arc::clone(&connector);
        // Failures are logged by the connector; no retry here.
        tokio::spawn(async move {
            let _ = outbound.connect_default().await;
        });
        connectors.push(connector);
    }

    wait_for_termination().await?;
    tracing::info!("Termination signal received, shutting down");
    manager.shutdown_all();

    tracing::info!("Shutdown complete");
    Ok(())
}
