//! Metrics collection and exposition.
//!
//! # Metrics
//! - `transport_connections_accepted_total` (counter): accepted sockets, by transport
//! - `transport_handshake_failures_total` (counter): TLS handshakes that did not complete
//! - `transport_active_connections` (gauge): connections currently tracked
//! - `transport_bytes_read_total` (counter): payload bytes delivered to callers
//! - `transport_bytes_written_total` (counter): payload bytes accepted by the socket
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; nothing is exported
//!   until `init_metrics` installs the Prometheus recorder

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::net::transport::TransportKind;

pub const CONNECTIONS_ACCEPTED: &str = "transport_connections_accepted_total";
pub const HANDSHAKE_FAILURES: &str = "transport_handshake_failures_total";
pub const ACTIVE_CONNECTIONS: &str = "transport_active_connections";
pub const BYTES_READ: &str = "transport_bytes_read_total";
pub const BYTES_WRITTEN: &str = "transport_bytes_written_total";

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Must run inside a Tokio runtime. Failure is logged, not fatal.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_accept(kind: TransportKind) {
    counter!(CONNECTIONS_ACCEPTED, "transport" => kind.to_string()).increment(1);
}

pub fn record_handshake_failure() {
    counter!(HANDSHAKE_FAILURES).increment(1);
}

pub fn record_connection_opened() {
    gauge!(ACTIVE_CONNECTIONS).increment(1.0);
}

pub fn record_connection_closed() {
    gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
}

pub fn record_bytes_read(n: usize) {
    counter!(BYTES_READ).increment(n as u64);
}

pub fn record_bytes_written(n: usize) {
    counter!(BYTES_WRITTEN).increment(n as u64);
}
