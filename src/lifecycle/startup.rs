//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Start the metrics exporter when enabled
//! - Bind the listener (TLS context first) and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listener starts last (traffic only when ready)

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::loader::ConfigError;
use crate::config::validation::validate_config;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::net::Listener;
use crate::observability::metrics;

/// Error type for startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid metrics address '{0}'")]
    MetricsAddress(String),
    #[error("listener failed: {0}")]
    Listener(#[from] TransportError),
}

/// Bring the service up from an already loaded configuration.
pub async fn start(config: &TransportConfig) -> Result<Listener, StartupError> {
    validate_config(config).map_err(ConfigError::Validation)?;

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::MetricsAddress(config.observability.metrics_address.clone()))?;
        metrics::init_metrics(addr);
    }

    let listener = Listener::bind(&config.listener, &config.timeouts).await?;

    tracing::info!(
        address = %listener.local_addr(),
        transport = %listener.kind(),
        socket_timeout_ms = config.timeouts.socket_ms,
        "Startup complete"
    );
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_config_fails_before_binding() {
        let mut config = TransportConfig::default();
        config.listener.bind_address = "127.0.0.1:0".into();
        config.timeouts.socket_ms = 0;
        assert!(matches!(start(&config).await, Err(StartupError::Config(_))));
    }

    #[tokio::test]
    async fn starts_plain_listener() {
        let mut config = TransportConfig::default();
        config.listener.bind_address = "127.0.0.1:0".into();
        let listener = start(&config).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        listener.close();
    }
}
