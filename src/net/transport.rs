//! Transport variants behind one operation set.
//!
//! A [`Stream`] is either a plain TCP socket or a TLS session over one. The
//! variant is chosen when the connection is built and never changes.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use rustls::pki_types::CertificateDer;
use rustls::{CommonState, HandshakeKind};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

use crate::error::{Result, TransportError};
use crate::net::negotiate::NEGOTIATED_PROTOCOL;

/// Longest cipher-suite name kept on a connection.
pub const MAX_CIPHER_NAME_LEN: usize = 128;

/// Attribute names understood by [`Stream::string_attribute`].
pub const CIPHER_SUITE: &str = "cipher-suite";
pub const PROTOCOL_VERSION: &str = "protocol-version";
pub const SERVER_NAME: &str = "server-name";

/// Which operation set a connection is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Secured,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Plain => f.write_str("plain"),
            TransportKind::Secured => f.write_str("tls"),
        }
    }
}

/// Negotiated cipher suite and its symmetric key strength.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherInfo {
    pub name: String,
    pub bits: u32,
}

/// An accepted or dialed socket, plaintext or TLS.
pub enum Stream {
    Plain(TcpStream),
    Secured(Box<TlsStream<TcpStream>>),
}

impl Stream {
    pub fn kind(&self) -> TransportKind {
        match self {
            Stream::Plain(_) => TransportKind::Plain,
            Stream::Secured(_) => TransportKind::Secured,
        }
    }

    pub fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(tcp) => tcp,
            Stream::Secured(tls) => tls.get_ref().0,
        }
    }

    fn tls_state(&self) -> Option<&CommonState> {
        match self {
            Stream::Plain(_) => None,
            Stream::Secured(tls) => Some(tls.get_ref().1),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// The peer's end-entity certificate.
    ///
    /// Plain transports return `Unsupported`; a TLS peer that presented no
    /// certificate yields `Ok(None)`.
    pub fn peer_certificate(&self) -> Result<Option<CertificateDer<'static>>> {
        let state = self
            .tls_state()
            .ok_or(TransportError::Unsupported("peer certificate on plaintext transport"))?;
        Ok(state
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|cert| cert.clone().into_owned()))
    }

    /// Whether the TLS session was resumed from a cached session.
    pub fn is_resumed(&self) -> bool {
        self.tls_state()
            .and_then(|state| state.handshake_kind())
            .is_some_and(|kind| kind == HandshakeKind::Resumed)
    }

    pub fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        self.tls_state()
            .and_then(|state| state.alpn_protocol())
            .map(<[u8]>::to_vec)
    }

    pub fn cipher(&self) -> Option<CipherInfo> {
        let suite = self.tls_state()?.negotiated_cipher_suite()?;
        let mut name = format!("{:?}", suite.suite());
        name.truncate(MAX_CIPHER_NAME_LEN);
        let bits = cipher_bits(&name);
        Some(CipherInfo { name, bits })
    }

    /// Look up a named string attribute; `None` means unavailable.
    pub fn string_attribute(&self, name: &str) -> Option<String> {
        let state = self.tls_state()?;
        match name {
            NEGOTIATED_PROTOCOL => state
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            CIPHER_SUITE => self.cipher().map(|c| c.name),
            PROTOCOL_VERSION => state.protocol_version().map(|v| format!("{:?}", v)),
            SERVER_NAME => match self {
                Stream::Secured(tls) => match &**tls {
                    TlsStream::Server(server) => server.get_ref().1.server_name().map(str::to_owned),
                    TlsStream::Client(_) => None,
                },
                Stream::Plain(_) => None,
            },
            _ => None,
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("kind", &self.kind())
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

/// Symmetric key strength implied by a suite name.
pub fn cipher_bits(suite_name: &str) -> u32 {
    if suite_name.contains("AES_256") || suite_name.contains("CHACHA20") {
        256
    } else if suite_name.contains("AES_128") {
        128
    } else {
        0
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Stream::Secured(tls) => Pin::new(&mut **tls).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Stream::Secured(tls) => Pin::new(&mut **tls).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            Stream::Secured(tls) => Pin::new(&mut **tls).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Stream::Secured(tls) => Pin::new(&mut **tls).poll_shutdown(cx),
        }
    }
}
