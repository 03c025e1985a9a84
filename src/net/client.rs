//! Outbound connections.
//!
//! Dials a listener and returns an `Established` [`Connection`] of the
//! matching kind. For TLS the client sends its protocol preference list and
//! its first preference the server also supports is used.
//!
//! A [`Connector`] keeps one TLS client configuration, so connections made
//! through the same connector can resume earlier sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::ring;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, TlsStream};

use crate::config::TimeoutConfig;
use crate::error::{Result, TransportError};
use crate::net::connection::{Connection, ConnectionOptions};
use crate::net::negotiate::Negotiator;
use crate::net::tls::{load_certs, load_key};
use crate::net::transport::Stream;

/// TLS settings for the client role.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsOptions {
    /// PEM files with the CA certificates to trust.
    pub root_cert_files: Vec<PathBuf>,
    /// Name sent as SNI and checked against the server certificate.
    pub server_name: String,
    /// Application protocols in preference order.
    pub next_protocols: Vec<String>,
    /// Client certificate and key, for servers that verify clients.
    pub identity: Option<(PathBuf, PathBuf)>,
}

/// Options for [`connect`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub tls: Option<ClientTlsOptions>,
    pub connect_timeout: Duration,
    pub connection: ConnectionOptions,
}

impl ClientOptions {
    /// Plaintext options taking the connect and socket deadlines from
    /// `timeouts`.
    pub fn from_timeouts(timeouts: &TimeoutConfig) -> Self {
        Self {
            tls: None,
            connect_timeout: Duration::from_millis(timeouts.connect_ms),
            connection: ConnectionOptions {
                socket_timeout: Duration::from_millis(timeouts.socket_ms),
                ..ConnectionOptions::default()
            },
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tls: None,
            connect_timeout: Duration::from_secs(5),
            connection: ConnectionOptions::default(),
        }
    }
}

fn client_config(options: &ClientTlsOptions) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for path in &options.root_cert_files {
        let (_, ignored) = roots.add_parsable_certificates(load_certs(path)?);
        if ignored > 0 {
            tracing::warn!(path = %path.display(), ignored, "Some root certificates could not be parsed");
        }
    }
    if roots.is_empty() {
        return Err(TransportError::config("client TLS needs at least one root certificate"));
    }
    let negotiator = Negotiator::from_names(&options.next_protocols)?;

    let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::config(e.to_string()))?
        .with_root_certificates(roots);
    let mut config = match &options.identity {
        Some((cert, key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| TransportError::config(e.to_string()))?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = negotiator.preferences();
    Ok(config)
}

/// Dials listeners with one set of [`ClientOptions`].
#[derive(Clone)]
pub struct Connector {
    tls: Option<(TlsConnector, ServerName<'static>)>,
    connect_timeout: Duration,
    connection: ConnectionOptions,
}

impl Connector {
    /// Build the TLS client state up front; nothing touches the network.
    pub fn new(options: &ClientOptions) -> Result<Self> {
        let tls = match &options.tls {
            Some(tls) => {
                let server_name = ServerName::try_from(tls.server_name.clone()).map_err(|e| {
                    TransportError::config(format!("invalid server name '{}': {}", tls.server_name, e))
                })?;
                Some((TlsConnector::from(Arc::new(client_config(tls)?)), server_name))
            }
            None => None,
        };
        Ok(Self {
            tls,
            connect_timeout: options.connect_timeout,
            connection: options.connection.clone(),
        })
    }

    /// Dial `addr`, run the TLS handshake when configured, and return an
    /// established connection.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Connection> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let stream = match &self.tls {
            None => Stream::Plain(tcp),
            Some((connector, server_name)) => {
                let handshake =
                    tokio::time::timeout(self.connect_timeout, connector.connect(server_name.clone(), tcp))
                        .await
                        .map_err(|_| TransportError::HandshakeFailed("handshake timed out".into()))?
                        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
                Stream::Secured(Box::new(TlsStream::Client(handshake)))
            }
        };

        let conn = Connection::established(stream, &self.connection);
        tracing::debug!(
            connection_id = %conn.id(),
            peer_addr = %addr,
            transport = %conn.kind(),
            resumed = conn.is_resumed(),
            "Connected"
        );
        Ok(conn)
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// One-shot [`Connector::connect`].
pub async fn connect(addr: SocketAddr, options: &ClientOptions) -> Result<Connection> {
    Connector::new(options)?.connect(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_client_needs_roots() {
        let options = ClientTlsOptions {
            server_name: "localhost".into(),
            ..ClientTlsOptions::default()
        };
        assert!(matches!(client_config(&options), Err(TransportError::ConfigurationInvalid(_))));
    }

    #[test]
    fn timeouts_drive_client_deadlines() {
        let timeouts = TimeoutConfig {
            connect_ms: 1500,
            socket_ms: 9000,
            ..TimeoutConfig::default()
        };
        let options = ClientOptions::from_timeouts(&timeouts);
        assert!(options.tls.is_none());
        assert_eq!(options.connect_timeout, Duration::from_millis(1500));
        assert_eq!(options.connection.socket_timeout, Duration::from_millis(9000));
    }

    #[test]
    fn bad_server_name_fails_before_dialing() {
        let dir = tempfile::tempdir().unwrap();
        let roots = dir.path().join("roots.pem");
        std::fs::write(&roots, "").unwrap();
        let options = ClientOptions {
            tls: Some(ClientTlsOptions {
                root_cert_files: vec![roots],
                server_name: "not a valid name!".into(),
                ..ClientTlsOptions::default()
            }),
            ..ClientOptions::default()
        };
        assert!(matches!(Connector::new(&options), Err(TransportError::ConfigurationInvalid(_))));
    }

    #[tokio::test]
    async fn refused_connection_is_io_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let err = connect(port, &ClientOptions::default()).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
