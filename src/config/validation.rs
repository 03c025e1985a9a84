//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Reject TLS option strings that cannot be compiled
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>
//! - File contents (certificates, keys) are checked when the TLS context is built

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{TlsConfig, TransportConfig};
use crate::net::negotiate::MAX_PROTOCOL_NAME_LEN;
use crate::net::tls::{parse_cipher_suites, ProtocolFlags};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a configuration, collecting every problem.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if config.timeouts.socket_ms == 0 {
        errors.push(ValidationError::new("timeouts.socket_ms", "must be greater than 0"));
    }
    if config.timeouts.connect_ms == 0 {
        errors.push(ValidationError::new("timeouts.connect_ms", "must be greater than 0"));
    }

    if let Some(tls) = &config.listener.tls {
        validate_tls(tls, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_tls(tls: &TlsConfig, errors: &mut Vec<ValidationError>) {
    if tls.cert_path.is_empty() {
        errors.push(ValidationError::new("listener.tls.cert_path", "is required"));
    }
    if tls.key_path.is_empty() {
        errors.push(ValidationError::new("listener.tls.key_path", "is required"));
    }
    if tls.handshake_timeout_ms == 0 {
        errors.push(ValidationError::new("listener.tls.handshake_timeout_ms", "must be greater than 0"));
    }
    if tls.session_cache && tls.session_cache_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "listener.tls.session_cache_timeout_secs",
            "must be greater than 0 when the session cache is enabled",
        ));
    }
    if let Some(protocol) = &tls.protocol {
        if let Err(e) = ProtocolFlags::parse(protocol) {
            errors.push(ValidationError::new("listener.tls.protocol", e.to_string()));
        }
    }
    if let Some(suites) = &tls.cipher_suite {
        if let Err(e) = parse_cipher_suites(suites) {
            errors.push(ValidationError::new("listener.tls.cipher_suite", e.to_string()));
        }
    }
    for (i, name) in tls.next_protocols.iter().enumerate() {
        if name.is_empty() || name.len() > MAX_PROTOCOL_NAME_LEN {
            errors.push(ValidationError::new(
                format!("listener.tls.next_protocols[{}]", i),
                format!("must be 1 to {} bytes", MAX_PROTOCOL_NAME_LEN),
            ));
        }
    }
    for (i, server) in tls.servers.iter().enumerate() {
        if server.name.is_empty() {
            errors.push(ValidationError::new(format!("listener.tls.servers[{}].name", i), "is required"));
        }
    }
}
