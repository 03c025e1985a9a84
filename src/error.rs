//! Error taxonomy shared by the transport, listener and host boundary.

use std::io;

use thiserror::Error;

/// Errors produced by transport operations.
///
/// `Timeout` and `Interrupted` are retryable. `Disconnect` and
/// `HandshakeFailed` end the affected connection only.
/// `ConfigurationInvalid` is fatal for listener construction.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The deadline elapsed before the operation could make progress.
    #[error("operation timed out")]
    Timeout,

    /// The peer went away or the socket failed unrecoverably.
    #[error("peer disconnected")]
    Disconnect,

    /// The operation was interrupted before completing.
    #[error("operation interrupted")]
    Interrupted,

    /// Listener or TLS configuration was rejected.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// TLS handshake did not complete.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection or listener has already been closed.
    #[error("closed")]
    Closed,

    /// The operation is not available for this transport.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Socket-level failure outside of read/write (bind, accept).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Interrupted)
    }

    /// Classify an I/O error raised during read or write.
    pub fn from_stream_error(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            io::ErrorKind::Interrupted => TransportError::Interrupted,
            _ => TransportError::Disconnect,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        TransportError::ConfigurationInvalid(msg.into())
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Interrupted.is_retryable());
        assert!(!TransportError::Disconnect.is_retryable());
        assert!(!TransportError::Closed.is_retryable());
    }

    #[test]
    fn stream_error_classification() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(TransportError::from_stream_error(timeout), TransportError::Timeout));

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(TransportError::from_stream_error(reset), TransportError::Disconnect));

        let intr = io::Error::new(io::ErrorKind::Interrupted, "signal");
        assert!(matches!(TransportError::from_stream_error(intr), TransportError::Interrupted));
    }
}
