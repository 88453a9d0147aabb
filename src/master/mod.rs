//! Master-side session acceptance.
//!
//! `MasterServerHandler` sits between a [`Listener`](crate::net::Listener)
//! and the session layer: it logs every decision, refuses certificates that
//! failed chain verification, and reports session close.

pub mod callbacks;
pub mod handler;

pub use callbacks::{CertificateInfo, ListenCallbacks};
pub use handler::MasterServerHandler;
