//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Own one socket, plaintext or TLS, from accept to close
//! - Track connection state (Created → Initializing → Established → HalfClosed → Closed)
//! - Generate unique connection IDs for tracing
//! - Count live connections for graceful shutdown
//!
//! # States
//! ```text
//! Created ──init──▶ Initializing ──ok──▶ Established ──read()==0──▶ HalfClosed
//!                        │                    │                        │
//!                        └──handshake error───┴──────close()───────────┴──▶ Closed
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::error::{Result, TransportError};
use crate::net::io;
use crate::net::listener::ConnectionPermit;
use crate::net::tls::TlsContext;
use crate::net::transport::{CipherInfo, Stream, TransportKind};
use crate::observability::metrics;

/// Longest textual socket address kept on a connection.
pub const MAX_ADDRESS_LEN: usize = 64;

/// Corked writes are flushed once this many bytes are pending.
pub const CORK_BUFFER_LIMIT: usize = 64 * 1024;

/// Attribute names for the address snapshots.
pub const LOCAL_ADDRESS: &str = "local-address";
pub const REMOTE_ADDRESS: &str = "remote-address";

/// Time allowed for a TLS close_notify during close.
const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_millis(500);

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, `init` not yet run.
    Created,
    /// TLS handshake in progress.
    Initializing,
    /// Ready for reads and writes.
    Established,
    /// Peer closed its side; writes may still be attempted.
    HalfClosed,
    /// Resources released. Terminal.
    Closed,
}

/// Per-connection settings copied from the listener.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Default read/write deadline.
    pub socket_timeout: Duration,
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Start corked.
    pub cork: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(65),
            no_delay: true,
            cork: false,
        }
    }
}

/// Aborts a connection from another task.
///
/// A read or write blocked on the connection returns `Disconnect`, and the
/// socket is released.
#[derive(Debug, Clone)]
pub struct ForceClose {
    tx: Arc<watch::Sender<bool>>,
}

impl ForceClose {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// One accepted or dialed socket.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    kind: TransportKind,
    tls: Option<Arc<TlsContext>>,
    /// Accepted socket waiting for `init`.
    raw: Option<TcpStream>,
    stream: Option<Stream>,
    socket_timeout: Duration,
    tolerate_unclean_eof: bool,
    bytes_read: u64,
    bytes_written: u64,
    no_delay: bool,
    cork: Option<Vec<u8>>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    cipher: Option<CipherInfo>,
    negotiated_protocol: Option<Vec<u8>>,
    resumed: bool,
    abort_tx: Arc<watch::Sender<bool>>,
    abort_rx: watch::Receiver<bool>,
    guard: Option<ConnectionGuard>,
}

impl Connection {
    /// Wrap an accepted socket. The transport kind is fixed here: secured
    /// when a TLS context is supplied.
    pub fn accepted(tcp: TcpStream, tls: Option<Arc<TlsContext>>, options: &ConnectionOptions) -> Self {
        if let Err(e) = tcp.set_nodelay(options.no_delay) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let kind = if tls.is_some() {
            TransportKind::Secured
        } else {
            TransportKind::Plain
        };
        let tolerate_unclean_eof = tls.as_ref().is_some_and(|ctx| ctx.tolerates_unclean_shutdown());
        let local_addr = tcp.local_addr().ok();
        let remote_addr = tcp.peer_addr().ok();

        let mut conn = Self::blank(kind, options);
        conn.tls = tls;
        conn.raw = Some(tcp);
        conn.tolerate_unclean_eof = tolerate_unclean_eof;
        conn.local_addr = local_addr;
        conn.remote_addr = remote_addr;
        conn
    }

    /// Wrap a stream whose handshake already completed (client side).
    pub fn established(stream: Stream, options: &ConnectionOptions) -> Self {
        if let Err(e) = stream.tcp().set_nodelay(options.no_delay) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let mut conn = Self::blank(stream.kind(), options);
        conn.establish(stream);
        conn
    }

    fn blank(kind: TransportKind, options: &ConnectionOptions) -> Self {
        let (abort_tx, abort_rx) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            state: ConnectionState::Created,
            kind,
            tls: None,
            raw: None,
            stream: None,
            socket_timeout: options.socket_timeout,
            tolerate_unclean_eof: false,
            bytes_read: 0,
            bytes_written: 0,
            no_delay: options.no_delay,
            cork: options.cork.then(Vec::new),
            local_addr: None,
            remote_addr: None,
            cipher: None,
            negotiated_protocol: None,
            resumed: false,
            abort_tx: Arc::new(abort_tx),
            abort_rx,
            guard: None,
        }
    }

    pub(crate) fn attach_guard(&mut self, guard: ConnectionGuard) {
        self.guard = Some(guard);
    }

    fn establish(&mut self, stream: Stream) {
        self.local_addr = stream.local_addr().ok().or(self.local_addr);
        self.remote_addr = stream.peer_addr().ok().or(self.remote_addr);
        self.cipher = stream.cipher();
        self.negotiated_protocol = stream.negotiated_protocol();
        self.resumed = stream.is_resumed();
        self.stream = Some(stream);
        self.state = ConnectionState::Established;
    }

    /// Bring a `Created` connection to `Established`, running the TLS
    /// handshake for secured connections. A failed handshake closes the
    /// socket and leaves the connection `Closed`.
    pub async fn init(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Created => {}
            ConnectionState::Closed => return Err(TransportError::Closed),
            _ => return Ok(()),
        }
        self.state = ConnectionState::Initializing;
        let tcp = self.raw.take().ok_or(TransportError::Closed)?;

        let stream = match self.tls.clone() {
            None => Stream::Plain(tcp),
            Some(ctx) => match ctx.handshake(tcp).await {
                Ok(tls) => Stream::Secured(Box::new(tls)),
                Err(e) => {
                    self.release();
                    return Err(e);
                }
            },
        };
        self.establish(stream);

        tracing::debug!(
            connection_id = %self.id,
            transport = %self.kind,
            peer_addr = ?self.remote_addr,
            cipher = ?self.cipher.as_ref().map(|c| c.name.as_str()),
            protocol = ?self.negotiated_protocol.as_deref().map(String::from_utf8_lossy),
            resumed = self.resumed,
            "Connection established"
        );
        Ok(())
    }

    fn aborted(&self) -> bool {
        *self.abort_rx.borrow()
    }

    /// Drop every owned resource and enter `Closed`.
    fn release(&mut self) {
        self.state = ConnectionState::Closed;
        self.stream = None;
        self.raw = None;
        self.tls = None;
        self.cork = None;
        self.guard = None;
    }

    fn check_usable(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Closed => Err(TransportError::Closed),
            ConnectionState::Created | ConnectionState::Initializing => {
                Err(TransportError::Unsupported("connection not initialized"))
            }
            ConnectionState::Established | ConnectionState::HalfClosed => {
                if self.aborted() {
                    self.release();
                    return Err(TransportError::Disconnect);
                }
                Ok(())
            }
        }
    }

    fn settle(&mut self, result: &Result<usize>) {
        if matches!(result, Err(TransportError::Disconnect)) && self.aborted() {
            tracing::debug!(connection_id = %self.id, "Connection force-closed");
            self.release();
        }
    }

    /// Read into `buf`, waiting up to `timeout` (the socket timeout when
    /// `None`). `Ok(0)` marks the connection half-closed.
    pub async fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        self.check_usable()?;
        let timeout = timeout.unwrap_or(self.socket_timeout);
        let tolerate = self.tolerate_unclean_eof;
        let mut abort = self.abort_rx.clone();
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        let result = tokio::select! {
            r = io::read_within(stream, buf, timeout, tolerate) => r,
            _ = abort.wait_for(|closed| *closed) => Err(TransportError::Disconnect),
        };
        self.after_read(&result);
        result
    }

    /// Read whatever is ready without waiting. Nothing ready is `Timeout`.
    pub fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_usable()?;
        let tolerate = self.tolerate_unclean_eof;
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let result = io::try_read(stream, buf, tolerate);
        self.after_read(&result);
        result
    }

    fn after_read(&mut self, result: &Result<usize>) {
        match result {
            Ok(0) => {
                if self.state == ConnectionState::Established {
                    tracing::trace!(connection_id = %self.id, "Peer closed read side");
                }
                self.state = ConnectionState::HalfClosed;
            }
            Ok(n) => {
                self.bytes_read += *n as u64;
                metrics::record_bytes_read(*n);
            }
            Err(_) => self.settle(result),
        }
    }

    /// Write all of `buf`. Either everything is sent or an error is
    /// returned; partial progress is never reported.
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.check_usable()?;
        if let Some(pending) = self.cork.as_mut() {
            pending.extend_from_slice(buf);
            if pending.len() < CORK_BUFFER_LIMIT {
                return Ok(());
            }
            return self.drain_cork().await;
        }
        self.write_through(buf).await
    }

    /// Send the corked bytes. On failure they go back into the cork buffer
    /// unless the connection was released.
    async fn drain_cork(&mut self) -> Result<()> {
        let data = match self.cork.as_mut() {
            Some(pending) if !pending.is_empty() => std::mem::take(pending),
            _ => return Ok(()),
        };
        let result = self.write_through(&data).await;
        if result.is_err() {
            if let Some(pending) = self.cork.as_mut() {
                let mut restored = data;
                restored.append(pending);
                *pending = restored;
            }
        }
        result
    }

    async fn write_through(&mut self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let timeout = self.socket_timeout;
        let mut abort = self.abort_rx.clone();
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        let result = tokio::select! {
            r = io::write_fully(stream, buf, timeout) => r,
            _ = abort.wait_for(|closed| *closed) => Err(TransportError::Disconnect),
        };
        if let Ok(n) = result {
            self.bytes_written += n as u64;
            metrics::record_bytes_written(n);
        }
        self.settle(&result);
        result.map(|_| ())
    }

    /// Write what the socket accepts right now; may be 0 or partial.
    pub fn write_nonblocking(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_usable()?;
        if let Some(pending) = self.cork.as_mut() {
            let room = CORK_BUFFER_LIMIT.saturating_sub(pending.len());
            let n = buf.len().min(room);
            pending.extend_from_slice(&buf[..n]);
            return Ok(n);
        }
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let result = io::try_write(stream, buf);
        if let Ok(n) = result {
            self.bytes_written += n as u64;
            metrics::record_bytes_written(n);
        }
        self.settle(&result);
        result
    }

    /// Send any corked bytes and flush the transport.
    pub async fn flush(&mut self) -> Result<()> {
        self.check_usable()?;
        self.drain_cork().await?;
        let timeout = self.socket_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        match tokio::time::timeout(timeout, stream.flush()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(e)) => Err(TransportError::from_stream_error(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Coalesce writes while corked; uncorking flushes what is pending.
    ///
    /// If that flush fails the connection stays corked with every pending
    /// byte kept.
    pub async fn set_cork(&mut self, enabled: bool) -> Result<()> {
        self.check_usable()?;
        match (enabled, self.cork.is_some()) {
            (true, false) => self.cork = Some(Vec::new()),
            (false, true) => {
                self.drain_cork().await?;
                self.cork = None;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn is_corked(&self) -> bool {
        self.cork.is_some()
    }

    /// Bytes waiting in the cork buffer.
    pub fn corked_len(&self) -> usize {
        self.cork.as_ref().map_or(0, Vec::len)
    }

    pub fn set_no_delay(&mut self, enabled: bool) -> Result<()> {
        self.check_usable()?;
        let stream = self.stream.as_ref().ok_or(TransportError::Closed)?;
        stream.tcp().set_nodelay(enabled)?;
        self.no_delay = enabled;
        Ok(())
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    /// Close the write side (TLS close_notify, then TCP FIN). Reads stay open.
    pub async fn shutdown_write(&mut self) -> Result<()> {
        self.flush().await?;
        let timeout = self.socket_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        match tokio::time::timeout(timeout, stream.shutdown()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(e)) => Err(TransportError::from_stream_error(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Release the socket. Safe in any state; a second call returns
    /// `Closed` and does nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(TransportError::Closed);
        }
        let pending = self.cork.take().filter(|p| !p.is_empty());
        if let Some(mut stream) = self.stream.take() {
            if !self.aborted() {
                if let Some(data) = pending {
                    if let Err(e) = io::write_fully(&mut stream, &data, CLOSE_NOTIFY_TIMEOUT).await {
                        tracing::debug!(connection_id = %self.id, error = %e, "Dropping corked bytes on close");
                    }
                }
                if stream.kind() == TransportKind::Secured {
                    let _ = tokio::time::timeout(CLOSE_NOTIFY_TIMEOUT, stream.shutdown()).await;
                }
            }
        }
        self.release();
        tracing::debug!(
            connection_id = %self.id,
            bytes_read = self.bytes_read,
            bytes_written = self.bytes_written,
            "Connection closed"
        );
        Ok(())
    }

    /// Handle for aborting this connection from another task.
    pub fn force_close_handle(&self) -> ForceClose {
        ForceClose {
            tx: Arc::clone(&self.abort_tx),
        }
    }

    /// DER of the peer's end-entity certificate.
    pub fn peer_certificate(&self) -> Result<Option<CertificateDer<'static>>> {
        if self.state == ConnectionState::Closed {
            return Err(TransportError::Closed);
        }
        if self.kind == TransportKind::Plain {
            return Err(TransportError::Unsupported("peer certificate on plaintext transport"));
        }
        match &self.stream {
            Some(stream) => stream.peer_certificate(),
            None => Err(TransportError::Unsupported("connection not initialized")),
        }
    }

    /// Named string attribute; `Ok(None)` means unavailable.
    pub fn string_attribute(&self, name: &str) -> Result<Option<String>> {
        if self.state == ConnectionState::Closed {
            return Err(TransportError::Closed);
        }
        let value = match name {
            LOCAL_ADDRESS => self.local_addr.map(address_text),
            REMOTE_ADDRESS => self.remote_addr.map(address_text),
            _ => self.stream.as_ref().and_then(|s| s.string_attribute(name)),
        };
        Ok(value)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_half_closed(&self) -> bool {
        self.state == ConnectionState::HalfClosed
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn cipher(&self) -> Option<&CipherInfo> {
        self.cipher.as_ref()
    }

    pub fn negotiated_protocol(&self) -> Option<&[u8]> {
        self.negotiated_protocol.as_deref()
    }

    /// Whether the TLS handshake resumed a cached session.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    pub fn set_socket_timeout(&mut self, timeout: Duration) {
        self.socket_timeout = timeout;
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

fn address_text(addr: SocketAddr) -> String {
    let mut text = addr.to_string();
    text.truncate(MAX_ADDRESS_LEN);
    text
}

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    /// Current count of active connections.
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        metrics::record_connection_opened();
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
            permit: None,
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all connections are closed. Returns false if `timeout`
    /// passes first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            while self.active_count.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
    /// Listener slot, released together with the guard.
    permit: Option<ConnectionPermit>,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Hold a listener slot for as long as this guard lives.
    pub(crate) fn with_permit(mut self, permit: ConnectionPermit) -> Self {
        self.permit = Some(permit);
        self
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        metrics::record_connection_closed();
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn plain_pair(options: &ConnectionOptions) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let conn = Connection::accepted(accepted.unwrap().0, None, options);
        (conn, client.unwrap())
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn operations_before_init_are_rejected() {
        let (mut conn, _client) = plain_pair(&ConnectionOptions::default()).await;
        assert_eq!(conn.state(), ConnectionState::Created);

        let mut buf = [0u8; 8];
        assert!(matches!(
            conn.read(&mut buf, Some(Duration::from_millis(10))).await,
            Err(TransportError::Unsupported(_))
        ));
        // closing a never-initialized connection is fine
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn plain_init_read_write_close() {
        let (mut conn, mut client) = plain_pair(&ConnectionOptions::default()).await;
        conn.init().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(conn.kind(), TransportKind::Plain);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        conn.write(b"world").await.unwrap();
        let mut echo = [0u8; 5];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"world");

        assert_eq!(conn.bytes_read(), 5);
        assert_eq!(conn.bytes_written(), 5);
        assert!(matches!(conn.peer_certificate(), Err(TransportError::Unsupported(_))));

        conn.close().await.unwrap();
        assert!(matches!(conn.close().await, Err(TransportError::Closed)));
        assert!(matches!(conn.write(b"x").await, Err(TransportError::Closed)));
        assert!(matches!(conn.string_attribute(REMOTE_ADDRESS), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn idle_read_times_out_and_stays_usable() {
        let (mut conn, mut client) = plain_pair(&ConnectionOptions::default()).await;
        conn.init().await.unwrap();

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf, Some(Duration::from_millis(100))).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(conn.state(), ConnectionState::Established);

        client.write_all(b"late").await.unwrap();
        let n = conn.read(&mut buf, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(&buf[..n], b"late");
    }

    #[tokio::test]
    async fn peer_close_half_closes() {
        let (mut conn, client) = plain_pair(&ConnectionOptions::default()).await;
        conn.init().await.unwrap();
        drop(client);

        let mut buf = [0u8; 8];
        let n = conn.read(&mut buf, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(n, 0);
        assert!(conn.is_half_closed());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn force_close_interrupts_blocked_read() {
        let (mut conn, _client) = plain_pair(&ConnectionOptions::default()).await;
        conn.init().await.unwrap();
        let handle = conn.force_close_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.close();
        });

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf, Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnect));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.close().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn corked_writes_are_coalesced_until_uncorked() {
        let options = ConnectionOptions {
            cork: true,
            ..ConnectionOptions::default()
        };
        let (mut conn, mut client) = plain_pair(&options).await;
        conn.init().await.unwrap();
        assert!(conn.is_corked());

        conn.write(b"ab").await.unwrap();
        conn.write(b"cd").await.unwrap();
        assert_eq!(conn.bytes_written(), 0);

        conn.set_cork(false).await.unwrap();
        assert_eq!(conn.bytes_written(), 4);

        let mut got = [0u8; 4];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"abcd");
    }

    #[tokio::test]
    async fn failed_uncork_keeps_pending_bytes() {
        let (mut conn, _client) = plain_pair(&ConnectionOptions::default()).await;
        conn.init().await.unwrap();
        // nothing can be sent once the write side is shut
        conn.shutdown_write().await.unwrap();

        conn.set_cork(true).await.unwrap();
        conn.write(b"ab").await.unwrap();
        conn.write(b"cd").await.unwrap();
        assert!(conn.set_cork(false).await.is_err());

        assert!(conn.is_corked());
        assert_eq!(conn.corked_len(), 4);
        assert_eq!(conn.bytes_written(), 0);
        assert!(conn.flush().await.is_err());
        assert_eq!(conn.corked_len(), 4);
    }

    #[tokio::test]
    async fn address_snapshots_are_available() {
        let (mut conn, client) = plain_pair(&ConnectionOptions::default()).await;
        conn.init().await.unwrap();

        let remote = conn.string_attribute(REMOTE_ADDRESS).unwrap().unwrap();
        assert_eq!(remote, client.local_addr().unwrap().to_string());
        assert!(remote.len() <= MAX_ADDRESS_LEN);
        assert_eq!(conn.string_attribute("negotiated-protocol").unwrap(), None);
    }
}
