//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, connection limits > 0)
//! - Detect duplicate names and unparseable addresses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ChannelConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::{ChannelConfig, TlsConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{section} entry has an empty name")]
    EmptyName { section: &'static str },
    #[error("duplicate {section} name '{name}'")]
    DuplicateName { section: &'static str, name: String },
    #[error("{name}: invalid address '{address}'")]
    InvalidAddress { name: String, address: String },
    #[error("{name}: max_connections must be greater than zero")]
    ZeroConnections { name: String },
    #[error("{name}: {field} must be greater than zero")]
    ZeroTimeout { name: String, field: &'static str },
    #[error("{name}: TLS enables no protocol version")]
    NoTlsVersion { name: String },
    #[error("invalid metrics address '{0}'")]
    InvalidMetricsAddress(String),
}

/// Check `config` and report every problem found.
pub fn validate_config(config: &ChannelConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut names = HashSet::new();
    for listener in &config.listeners {
        check_name("listener", &listener.name, &mut names, &mut errors);
        if listener.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidAddress {
                name: listener.name.clone(),
                address: listener.bind_address.clone(),
            });
        }
        if listener.max_connections == 0 {
            errors.push(ValidationError::ZeroConnections {
                name: listener.name.clone(),
            });
        }
        if listener.handshake_timeout_ms == 0 {
            errors.push(ValidationError::ZeroTimeout {
                name: listener.name.clone(),
                field: "handshake_timeout_ms",
            });
        }
        check_tls(&listener.name, listener.tls.as_ref(), &mut errors);
    }

    let mut names = HashSet::new();
    for connector in &config.connectors {
        check_name("connector", &connector.name, &mut names, &mut errors);
        // Host names are allowed here; only the port shape is checked.
        if connector.remote_address.rsplit_once(':').and_then(|(_, port)| port.parse::<u16>().ok()).is_none() {
            errors.push(ValidationError::InvalidAddress {
                name: connector.name.clone(),
                address: connector.remote_address.clone(),
            });
        }
        if connector.connect_timeout_ms == 0 {
            errors.push(ValidationError::ZeroTimeout {
                name: connector.name.clone(),
                field: "connect_timeout_ms",
            });
        }
        if connector.handshake_timeout_ms == 0 {
            errors.push(ValidationError::ZeroTimeout {
                name: connector.name.clone(),
                field: "handshake_timeout_ms",
            });
        }
        check_tls(&connector.name, connector.tls.as_ref(), &mut errors);
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidMetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_name<'a>(
    section: &'static str,
    name: &'a str,
    seen: &mut HashSet<&'a str>,
    errors: &mut Vec<ValidationError>,
) {
    if name.is_empty() {
        errors.push(ValidationError::EmptyName { section });
    } else if !seen.insert(name) {
        errors.push(ValidationError::DuplicateName {
            section,
            name: name.to_string(),
        });
    }
}

fn check_tls(name: &str, tls: Option<&TlsConfig>, errors: &mut Vec<ValidationError>) {
    if let Some(tls) = tls {
        if !tls.allow_tls12 && !tls.allow_tls13 {
            errors.push(ValidationError::NoTlsVersion {
                name: name.to_string(),
            });
        }
    }
}
