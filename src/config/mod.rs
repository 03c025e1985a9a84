//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TransportConfig (validated, immutable)
//!     → listener builds its TLS context once from it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the TLS context never changes under a live listener
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::ListenerConfig;
pub use schema::ServerCertConfig;
pub use schema::TimeoutConfig;
pub use schema::TlsConfig;
pub use schema::TransportConfig;
pub use schema::VerifyClient;
