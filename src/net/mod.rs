//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits, socket options)
//!     → connection.rs (Created, lifecycle tracking)
//!     → tls.rs (handshake; negotiate.rs picks the application protocol)
//!     → transport.rs (Plain | Secured stream, io.rs deadlines)
//!     → Hand off to the connection handler
//!
//! Outgoing:
//!     client.rs → TCP connect → TLS client handshake → connection.rs
//!
//! Connection States:
//!     Created → Initializing → Established → HalfClosed → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently behind one stream type
//! - TLS state is built once per listener and shared read-only

pub mod client;
pub mod connection;
pub mod io;
pub mod listener;
pub mod negotiate;
pub mod session;
pub mod tls;
pub mod transport;

pub use client::{connect, ClientOptions, ClientTlsOptions, Connector};
pub use connection::{Connection, ConnectionId, ConnectionOptions, ConnectionState, ForceClose};
pub use listener::Listener;
pub use negotiate::{select_next_protocol, Negotiator, ProtocolList};
pub use tls::TlsContext;
pub use transport::{Stream, TransportKind};
