//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! listener / connection / tls:
//!     → logging.rs (structured tracing events, connection_id fields)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout (fmt layer)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields on every event, never formatted strings
//! - Metrics are cheap; recording without an installed exporter is a no-op

pub mod logging;
pub mod metrics;
