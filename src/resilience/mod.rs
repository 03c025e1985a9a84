//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Accept loop:
//!     → accept() fails (EMFILE, ECONNABORTED, ...)
//!     → backoff.rs (sleep with growing, jittered delay)
//!     → retry accept; success resets the delay
//! ```
//!
//! # Design Decisions
//! - Accept errors never end the serve loop; only shutdown or close does
//! - Jitter keeps many listeners from retrying in lockstep

pub mod backoff;
