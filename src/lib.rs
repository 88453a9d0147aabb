//! DNP3 network channel layer.
//!
//! Turns accepted or connected sockets into authenticated, shutdown-safe
//! byte channels and tracks every listener, connector and channel for
//! coordinated teardown.
//!
//! ```text
//!  Listener ──accept──▶ decision ──▶ [TLS handshake + verify] ──▶ Channel ──▶ ServerHandler
//!  Connector ─connect─────────────▶ [TLS handshake + verify] ──▶ Channel ──▶ ClientHandler
//!                                        │
//!              every Listener / Connector / Channel registers with ResourceManager
//! ```

// Core subsystems
pub mod executor;
pub mod lifecycle;
pub mod net;
pub mod tls;

// Session layer adapters
pub mod master;

// Cross-cutting concerns
pub mod config;
pub mod observability;

pub use config::schema::ChannelConfig;
pub use executor::Strand;
pub use lifecycle::{Resource, ResourceManager};
pub use net::{Channel, Connector, Listener, SessionId};
