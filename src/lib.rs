//! TLS connection transport with application protocol negotiation.
//!
//! A [`Listener`](net::Listener) binds a port and hands out
//! [`Connection`](net::Connection)s that are either plaintext or TLS behind
//! one operation set. During the TLS handshake the application protocol is
//! the client's first preference that the server also lists
//! ([`select_next_protocol`](net::select_next_protocol)).
//!
//! [`host::HostBridge`] exposes the same operations through opaque handles
//! and primitive result codes.

// Core subsystems
pub mod config;
pub mod error;
pub mod host;
pub mod net;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use lifecycle::Shutdown;
