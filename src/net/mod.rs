//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits, SessionId)
//!     → handler.rs ServerHandler::accept_connection (inline decision)
//!     → [TLS] handshake + ServerHandler::verify_certificate per certificate
//!     → channel.rs (Channel on a fresh Strand, registered with the manager)
//!     → ServerHandler::accept_stream (ownership moves to the upper layer)
//!
//! Outgoing:
//!     connector.rs connect(remote) → same handshake → ClientHandler::accept_stream
//!
//! Channel States:
//!     Open → ShuttingDown → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Every listener, connector and channel is a `Resource`
//! - TLS is optional and selected at construction

pub mod channel;
pub mod connector;
pub mod handler;
pub mod listener;
pub mod session;

pub use channel::{Channel, ChannelError, ChannelKind, ChannelState};
pub use connector::{ConnectError, Connector};
pub use handler::{ClientHandler, ServerHandler};
pub use listener::{ConnectionPermit, Listener, ListenerError, ListenerState};
pub use session::SessionId;
