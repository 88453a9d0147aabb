//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Construction:
//!     Listener / Connector / Channel created
//!         → ResourceManager::register (Weak entry + RAII handle)
//!         → register refused while shutting down → creator shuts itself down
//!
//! Teardown (manager.rs):
//!     Signal received (signals.rs) or owner decides
//!         → ResourceManager::shutdown_all
//!         → close registry + snapshot under lock
//!         → Resource::shutdown on each, lock released
//!
//! Owner-initiated:
//!     Resource::shutdown → drop RegistrationHandle → entry removed
//! ```
//!
//! # Design Decisions
//! - One manager per network stack, passed explicitly (no global)
//! - Shutdown is a request; completions may still arrive as shutdown errors

pub mod manager;
pub mod resource;
pub mod signals;

pub use manager::{RegisterError, RegistrationHandle, ResourceManager};
pub use resource::Resource;
