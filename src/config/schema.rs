//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the transport.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the transport service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Listener configuration (bind address, socket options, TLS).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// Optional TLS configuration. Absent means plaintext.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Listen backlog passed to the kernel.
    pub backlog: u32,

    /// Enable TCP keepalive on accepted sockets.
    pub keepalive: bool,

    /// Disable Nagle's algorithm on accepted sockets.
    pub tcp_no_delay: bool,

    /// Start accepted connections corked (writes coalesced until flush).
    pub cork: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8443".to_string(),
            tls: None,
            max_connections: 10_000,
            backlog: 1024,
            keepalive: true,
            tcp_no_delay: true,
            cork: false,
        }
    }
}

/// Client certificate verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum VerifyClient {
    /// Do not request a client certificate.
    #[default]
    #[serde(rename = "none")]
    None,
    /// Request a certificate and accept it without CA verification.
    #[serde(rename = "optional-no-ca", alias = "optional_no_ca")]
    OptionalNoCa,
    /// Request a certificate and verify it against the CA if presented.
    #[serde(rename = "optional")]
    Optional,
    /// Require a certificate verified against the CA.
    #[serde(rename = "require")]
    Require,
}

impl std::str::FromStr for VerifyClient {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(VerifyClient::None),
            "optional-no-ca" | "optional_no_ca" => Ok(VerifyClient::OptionalNoCa),
            "optional" => Ok(VerifyClient::Optional),
            "require" => Ok(VerifyClient::Require),
            other => Err(format!(
                "'{}' is an unknown value for verify-client; valid values are 'none', 'optional-no-ca', 'optional' and 'require'",
                other
            )),
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// Extra intermediate certificates appended to the served chain.
    pub certificate_chain_file: Option<String>,

    /// Directory of PEM CA certificates used to verify clients.
    pub ca_certificate_path: Option<String>,

    /// PEM bundle of CA certificates used to verify clients.
    pub ca_certificate_file: Option<String>,

    /// Directory of PEM certificate revocation lists.
    pub ca_revocation_path: Option<String>,

    /// PEM bundle of certificate revocation lists.
    pub ca_revocation_file: Option<String>,

    /// Crypto engine name. Only the built-in `ring` provider exists.
    pub engine: Option<String>,

    /// Engine-specific commands.
    pub engine_commands: Vec<String>,

    /// Key name held by the crypto engine.
    pub engine_key: Option<String>,

    /// Private key password.
    pub password: Option<String>,

    /// Protocol version selection, e.g. "-all +tlsv1.2 +tlsv1.3".
    pub protocol: Option<String>,

    /// Enable the server-side session cache.
    pub session_cache: bool,

    /// Session cache entry lifetime in seconds.
    pub session_cache_timeout_secs: u64,

    /// Treat a peer closing TCP without close_notify as a clean EOF.
    pub unclean_shutdown: bool,

    /// Client certificate policy.
    pub verify_client: VerifyClient,

    /// Maximum number of intermediate certificates in a client chain.
    pub verify_depth: Option<u32>,

    /// Colon-separated list of cipher suite names.
    pub cipher_suite: Option<String>,

    /// Prefer the server's cipher order over the client's.
    pub honor_cipher_order: bool,

    /// Request TLS-level compression.
    pub compression: bool,

    /// Application protocols in preference order, e.g. ["h2", "http/1.1"].
    pub next_protocols: Vec<String>,

    /// Handshake deadline in milliseconds.
    pub handshake_timeout_ms: u64,

    /// Virtual servers selected by SNI.
    pub servers: Vec<ServerCertConfig>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: String::new(),
            key_path: String::new(),
            certificate_chain_file: None,
            ca_certificate_path: None,
            ca_certificate_file: None,
            ca_revocation_path: None,
            ca_revocation_file: None,
            engine: None,
            engine_commands: Vec::new(),
            engine_key: None,
            password: None,
            protocol: None,
            session_cache: true,
            session_cache_timeout_secs: 300,
            unclean_shutdown: false,
            verify_client: VerifyClient::None,
            verify_depth: None,
            cipher_suite: None,
            honor_cipher_order: false,
            compression: false,
            next_protocols: Vec::new(),
            handshake_timeout_ms: 10_000,
            servers: Vec::new(),
        }
    }
}

impl TlsConfig {
    /// Minimal configuration from a certificate and key.
    pub fn new(cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ..Self::default()
        }
    }
}

/// Certificate for one SNI host name.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerCertConfig {
    /// Host name matched against the client's SNI.
    pub name: String,

    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Accept timeout in milliseconds (0 waits forever).
    pub accept_ms: u64,

    /// Outbound connection establishment timeout in milliseconds.
    pub connect_ms: u64,

    /// Default read/write deadline on accepted connections in milliseconds.
    pub socket_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            accept_ms: 0,
            connect_ms: 5_000,
            socket_ms: 65_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
