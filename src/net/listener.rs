//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Build the TLS context before binding, so bad TLS settings never leave a socket bound
//! - Bind to the configured address with reuse-address and backlog
//! - Accept incoming TCP connections and apply per-socket options
//! - Enforce max_connections limit via semaphore
//! - Run the handshake for each accepted socket; failures never stop accepting
//!
//! # Design Decisions
//! - The listener never falls back to plaintext when TLS is configured
//! - `serve` hands each socket to its own task before the handshake so a slow
//!   client cannot stall the accept loop
//! - `close` is idempotent and wakes any task blocked in `accept`

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::config::{ListenerConfig, TimeoutConfig};
use crate::error::{Result, TransportError};
use crate::lifecycle::Shutdown;
use crate::net::connection::{Connection, ConnectionId, ConnectionOptions, ConnectionTracker};
use crate::net::tls::TlsContext;
use crate::net::transport::TransportKind;
use crate::observability::metrics;
use crate::resilience::backoff::Backoff;

/// Socket and TLS state released by `close`.
struct Bound {
    socket: Arc<TcpListener>,
    tls: Option<Arc<TlsContext>>,
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    bound: Mutex<Option<Bound>>,
    closed: watch::Sender<bool>,
    local_addr: SocketAddr,
    kind: TransportKind,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Configured maximum connections.
    max_connections: usize,
    tracker: ConnectionTracker,
    options: ConnectionOptions,
    keepalive: bool,
    accept_timeout: Option<Duration>,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    ///
    /// TLS configuration is validated first; an unusable certificate, key or
    /// option fails with `ConfigurationInvalid` and nothing is bound.
    pub async fn bind(config: &ListenerConfig, timeouts: &TimeoutConfig) -> Result<Self> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            TransportError::config(format!("invalid bind address '{}': {}", config.bind_address, e))
        })?;
        if config.max_connections == 0 {
            return Err(TransportError::config("max_connections must be greater than 0"));
        }

        let tls = config
            .tls
            .as_ref()
            .map(TlsContext::from_config)
            .transpose()?
            .map(Arc::new);
        let kind = if tls.is_some() {
            TransportKind::Secured
        } else {
            TransportKind::Plain
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            address = %local_addr,
            transport = %kind,
            max_connections = config.max_connections,
            backlog = config.backlog,
            "Listener bound"
        );

        let (closed, _) = watch::channel(false);
        Ok(Self {
            bound: Mutex::new(Some(Bound {
                socket: Arc::new(listener),
                tls,
            })),
            closed,
            local_addr,
            kind,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            tracker: ConnectionTracker::new(),
            options: ConnectionOptions {
                socket_timeout: Duration::from_millis(timeouts.socket_ms),
                no_delay: config.tcp_no_delay,
                cork: config.cork,
            },
            keepalive: config.keepalive,
            accept_timeout: (timeouts.accept_ms > 0).then(|| Duration::from_millis(timeouts.accept_ms)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Bound>> {
        self.bound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> Result<(Arc<TcpListener>, Option<Arc<TlsContext>>)> {
        let bound = self.lock();
        let bound = bound.as_ref().ok_or(TransportError::Closed)?;
        Ok((Arc::clone(&bound.socket), bound.tls.clone()))
    }

    /// Accept the next socket without running its handshake.
    ///
    /// Waits for a connection slot first (backpressure). The returned
    /// connection is `Created`; call [`Connection::init`] before using it.
    pub async fn accept_pending(&self) -> Result<Connection> {
        let (socket, tls) = self.snapshot()?;
        let mut closed = self.closed.subscribe();

        let accepted = async {
            // Acquire permit first (backpressure)
            let permit = Arc::clone(&self.connection_limit)
                .acquire_owned()
                .await
                .map_err(|_| TransportError::Closed)?;
            let (tcp, peer_addr) = accept_socket(&socket, self.accept_timeout).await?;
            Ok::<_, TransportError>((tcp, peer_addr, permit))
        };
        let (tcp, peer_addr, permit) = tokio::select! {
            r = accepted => r?,
            _ = closed.wait_for(|closed| *closed) => return Err(TransportError::Closed),
        };

        if self.keepalive {
            if let Err(e) = SockRef::from(&tcp).set_keepalive(true) {
                tracing::debug!(peer_addr = %peer_addr, error = %e, "Failed to enable keepalive");
            }
        }
        metrics::record_accept(self.kind);

        let mut conn = Connection::accepted(tcp, tls, &self.options);
        let guard = self
            .tracker
            .track(conn.id())
            .with_permit(ConnectionPermit { _permit: permit });
        conn.attach_guard(guard);

        tracing::debug!(
            connection_id = %conn.id(),
            peer_addr = %peer_addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );
        Ok(conn)
    }

    /// Accept the next connection that completes initialization.
    ///
    /// Sockets whose handshake fails are closed, logged and counted; accept
    /// then keeps waiting for the next peer.
    pub async fn accept(&self) -> Result<Connection> {
        loop {
            let mut conn = self.accept_pending().await?;
            match conn.init().await {
                Ok(()) => return Ok(conn),
                Err(e) => handshake_failed(conn.id(), conn.remote_addr(), &e),
            }
        }
    }

    /// Accept until `shutdown` fires or the listener is closed, running
    /// each connection's handshake and `handler` on its own task.
    pub async fn serve<H, Fut>(&self, shutdown: Shutdown, handler: H) -> Result<()>
    where
        H: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut backoff = Backoff::for_accept();

        loop {
            let next = tokio::select! {
                r = self.accept_pending() => r,
                _ = shutdown.wait() => break,
            };

            match next {
                Ok(mut conn) => {
                    backoff.reset();
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        match conn.init().await {
                            Ok(()) => handler(conn).await,
                            Err(e) => handshake_failed(conn.id(), conn.remote_addr(), &e),
                        }
                    });
                }
                Err(TransportError::Closed) => break,
                Err(TransportError::Timeout) => continue,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        attempt = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Accept failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        tracing::info!(address = %self.local_addr, "Accept loop stopped");
        Ok(())
    }

    /// Wait for tracked connections to finish. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let active = self.tracker.active_count();
        if active > 0 {
            tracing::info!(active_connections = active, "Draining connections");
        }
        self.tracker.wait_idle(timeout).await
    }

    /// Stop accepting and release the listening socket and TLS context.
    ///
    /// Idempotent. Established connections are unaffected.
    pub fn close(&self) {
        let already_closed = self.closed.send_replace(true);
        let released = self.lock().take();
        self.connection_limit.close();
        if !already_closed && released.is_some() {
            tracing::info!(address = %self.local_addr, "Listener closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The TLS context, until the listener is closed.
    pub fn tls(&self) -> Option<Arc<TlsContext>> {
        self.lock().as_ref().and_then(|bound| bound.tls.clone())
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

async fn accept_socket(socket: &TcpListener, timeout: Option<Duration>) -> Result<(TcpStream, SocketAddr)> {
    let accepted = match timeout {
        Some(limit) => tokio::time::timeout(limit, socket.accept())
            .await
            .map_err(|_| TransportError::Timeout)?,
        None => socket.accept().await,
    };
    Ok(accepted?)
}

fn handshake_failed(id: ConnectionId, peer_addr: Option<SocketAddr>, error: &TransportError) {
    metrics::record_handshake_failure();
    tracing::warn!(
        connection_id = %id,
        peer_addr = ?peer_addr,
        error = %error,
        "Connection initialization failed"
    );
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
