//! Handle-based entry points for a foreign host process.
//!
//! Listeners and connections live in handle tables; the host only sees
//! positive `i64` handles, byte counts, and the negative result codes in
//! [`codes`]. Nothing from the host's object model crosses this boundary.
//!
//! Reads and writes on one connection handle are serialized. `close` aborts
//! any blocked read or write on the handle first, so it never waits behind
//! one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::config::{ListenerConfig, TimeoutConfig};
use crate::error::TransportError;
use crate::net::connection::{Connection, ForceClose};
use crate::net::listener::Listener;

/// Primitive result codes. Non-negative values are handles or byte counts.
pub mod codes {
    pub const ERROR: i64 = -1;
    pub const INTERRUPTED: i64 = -2;
    pub const DISCONNECT: i64 = -3;
    pub const TIMEOUT: i64 = -4;
    pub const CLOSED: i64 = -5;
    pub const UNSUPPORTED: i64 = -6;
    pub const INVALID_HANDLE: i64 = -7;
    pub const CONFIGURATION: i64 = -8;
    pub const HANDSHAKE: i64 = -9;
}

/// Result code for an error.
pub fn result_code(err: &TransportError) -> i64 {
    match err {
        TransportError::Timeout => codes::TIMEOUT,
        TransportError::Disconnect => codes::DISCONNECT,
        TransportError::Interrupted => codes::INTERRUPTED,
        TransportError::ConfigurationInvalid(_) => codes::CONFIGURATION,
        TransportError::HandshakeFailed(_) => codes::HANDSHAKE,
        TransportError::Closed => codes::CLOSED,
        TransportError::Unsupported(_) => codes::UNSUPPORTED,
        TransportError::Io(_) => codes::ERROR,
    }
}

fn len_code(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

struct ConnectionEntry {
    conn: Mutex<Connection>,
    abort: ForceClose,
}

/// Handle tables for listeners and connections.
pub struct HostBridge {
    listeners: DashMap<u64, Arc<Listener>>,
    connections: DashMap<u64, Arc<ConnectionEntry>>,
    next_handle: AtomicU64,
}

impl HostBridge {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            connections: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    fn allocate(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn listener(&self, handle: i64) -> Option<Arc<Listener>> {
        let key = u64::try_from(handle).ok()?;
        self.listeners.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    fn connection(&self, handle: i64) -> Option<Arc<ConnectionEntry>> {
        let key = u64::try_from(handle).ok()?;
        self.connections.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    fn register(&self, conn: Connection) -> i64 {
        let handle = self.allocate();
        let abort = conn.force_close_handle();
        self.connections.insert(
            handle,
            Arc::new(ConnectionEntry {
                conn: Mutex::new(conn),
                abort,
            }),
        );
        handle as i64
    }

    /// Bind a listener. Returns its handle or a negative code.
    pub async fn bind(&self, config: &ListenerConfig, timeouts: &TimeoutConfig) -> i64 {
        match Listener::bind(config, timeouts).await {
            Ok(listener) => {
                let handle = self.allocate();
                self.listeners.insert(handle, Arc::new(listener));
                handle as i64
            }
            Err(e) => {
                tracing::error!(bind_address = %config.bind_address, error = %e, "Host bind failed");
                result_code(&e)
            }
        }
    }

    /// Accept an established connection. Returns its handle or a negative code.
    pub async fn accept(&self, listener: i64) -> i64 {
        let Some(listener) = self.listener(listener) else {
            return codes::INVALID_HANDLE;
        };
        match listener.accept().await {
            Ok(conn) => self.register(conn),
            Err(e) => result_code(&e),
        }
    }

    /// Read into `buf`. `timeout_ms < 0` uses the socket timeout, `0` polls
    /// once. Returns the byte count (0 on clean disconnect) or a code.
    pub async fn read(&self, conn: i64, buf: &mut [u8], timeout_ms: i64) -> i64 {
        let Some(entry) = self.connection(conn) else {
            return codes::INVALID_HANDLE;
        };
        let mut conn = entry.conn.lock().await;
        let result = match timeout_ms {
            0 => conn.read_nonblocking(buf),
            t if t < 0 => conn.read(buf, None).await,
            t => conn.read(buf, Some(Duration::from_millis(t as u64))).await,
        };
        match result {
            Ok(n) => len_code(n),
            Err(e) => result_code(&e),
        }
    }

    /// Write all of `buf`. Returns its length or a code.
    pub async fn write(&self, conn: i64, buf: &[u8]) -> i64 {
        let Some(entry) = self.connection(conn) else {
            return codes::INVALID_HANDLE;
        };
        let mut conn = entry.conn.lock().await;
        match conn.write(buf).await {
            Ok(()) => len_code(buf.len()),
            Err(e) => result_code(&e),
        }
    }

    /// Write what the socket takes now. Returns the count (possibly 0) or a code.
    pub async fn write_nonblocking(&self, conn: i64, buf: &[u8]) -> i64 {
        let Some(entry) = self.connection(conn) else {
            return codes::INVALID_HANDLE;
        };
        let mut conn = entry.conn.lock().await;
        match conn.write_nonblocking(buf) {
            Ok(n) => len_code(n),
            Err(e) => result_code(&e),
        }
    }

    /// Flush corked bytes.
    pub async fn flush(&self, conn: i64) -> i64 {
        let Some(entry) = self.connection(conn) else {
            return codes::INVALID_HANDLE;
        };
        let mut conn = entry.conn.lock().await;
        match conn.flush().await {
            Ok(()) => 0,
            Err(e) => result_code(&e),
        }
    }

    /// Close the connection. The handle stays valid until [`free`](Self::free);
    /// closing again returns `CLOSED`.
    pub async fn close(&self, conn: i64) -> i64 {
        let Some(entry) = self.connection(conn) else {
            return codes::INVALID_HANDLE;
        };
        let (mut guard, aborted) = match entry.conn.try_lock() {
            Ok(guard) => (guard, false),
            Err(_) => {
                // A read or write holds the lock; abort it, then close.
                entry.abort.close();
                (entry.conn.lock().await, true)
            }
        };
        match guard.close().await {
            Ok(()) => 0,
            // The aborted call already released the socket.
            Err(TransportError::Closed) if aborted => 0,
            Err(e) => result_code(&e),
        }
    }

    /// Drop the connection handle, closing the connection if still open.
    pub async fn free(&self, conn: i64) -> i64 {
        let Some(key) = u64::try_from(conn).ok() else {
            return codes::INVALID_HANDLE;
        };
        let Some((_, entry)) = self.connections.remove(&key) else {
            return codes::INVALID_HANDLE;
        };
        entry.abort.close();
        let mut conn = entry.conn.lock().await;
        let _ = conn.close().await;
        0
    }

    /// Close and drop a listener handle.
    pub fn close_listener(&self, listener: i64) -> i64 {
        let Some(key) = u64::try_from(listener).ok() else {
            return codes::INVALID_HANDLE;
        };
        match self.listeners.remove(&key) {
            Some((_, listener)) => {
                listener.close();
                0
            }
            None => codes::INVALID_HANDLE,
        }
    }

    /// Copy a string attribute into `buf`. Returns its length, 0 when
    /// unavailable, or `ERROR` when `buf` is too small.
    pub async fn attribute(&self, conn: i64, name: &str, buf: &mut [u8]) -> i64 {
        let Some(entry) = self.connection(conn) else {
            return codes::INVALID_HANDLE;
        };
        let conn = entry.conn.lock().await;
        match conn.string_attribute(name) {
            Ok(Some(value)) => copy_out(value.as_bytes(), buf),
            Ok(None) => 0,
            Err(e) => result_code(&e),
        }
    }

    /// Copy the peer certificate (DER) into `buf`. Returns its length, 0 when
    /// the peer sent none, or `ERROR` when `buf` is too small.
    pub async fn peer_certificate(&self, conn: i64, buf: &mut [u8]) -> i64 {
        let Some(entry) = self.connection(conn) else {
            return codes::INVALID_HANDLE;
        };
        let conn = entry.conn.lock().await;
        match conn.peer_certificate() {
            Ok(Some(cert)) => copy_out(cert.as_ref(), buf),
            Ok(None) => 0,
            Err(e) => result_code(&e),
        }
    }

    /// Symmetric key strength of the negotiated cipher, 0 for plaintext.
    pub async fn cipher_bits(&self, conn: i64) -> i64 {
        let Some(entry) = self.connection(conn) else {
            return codes::INVALID_HANDLE;
        };
        let conn = entry.conn.lock().await;
        conn.cipher().map_or(0, |c| i64::from(c.bits))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for HostBridge {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_out(value: &[u8], buf: &mut [u8]) -> i64 {
    match buf.get_mut(..value.len()) {
        Some(dst) => {
            dst.copy_from_slice(value);
            len_code(value.len())
        }
        None => codes::ERROR,
    }
}
