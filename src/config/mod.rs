//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ChannelConfig (validated, immutable)
//!     → ListenerConfig / ConnectorConfig handed to net at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only TLS material can be swapped live
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ChannelConfig, ConnectorConfig, ListenerConfig, LogFormat, ObservabilityConfig, TlsConfig,
};
pub use validation::{validate_config, ValidationError};
