//! secure-transport echo service.
//!
//! Binds the configured listener (plaintext or TLS), echoes every byte each
//! client sends, and logs the negotiated protocol and cipher per connection.
//!
//! ```text
//!     Client ──TCP──▶ listener ──TLS handshake + ALPN──▶ connection task ──echo──▶ Client
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use secure_transport::config::loader::load_config;
use secure_transport::config::TransportConfig;
use secure_transport::lifecycle::{signals, startup, Shutdown};
use secure_transport::net::Connection;
use secure_transport::observability::logging::init_logging;
use secure_transport::TransportError;

/// Drain deadline after the accept loop stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "secure-transport")]
#[command(about = "TLS echo service with application protocol negotiation", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TransportConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "secure-transport starting");

    let listener = Arc::new(startup::start(&config).await?);

    let shutdown = Shutdown::new();
    tokio::spawn(signals::shutdown_on_signal(shutdown.clone()));

    listener.serve(shutdown, echo).await?;
    listener.close();

    if !listener.drain(DRAIN_TIMEOUT).await {
        tracing::warn!(
            active_connections = listener.active_connections(),
            "Drain deadline passed; dropping remaining connections"
        );
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn echo(mut conn: Connection) {
    tracing::info!(
        connection_id = %conn.id(),
        peer_addr = ?conn.remote_addr(),
        transport = %conn.kind(),
        protocol = ?conn.negotiated_protocol().map(String::from_utf8_lossy),
        cipher = ?conn.cipher().map(|c| c.name.as_str()),
        "Serving connection"
    );

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match conn.read(&mut buf, None).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = conn.write(&buf[..n]).await {
                    tracing::debug!(connection_id = %conn.id(), error = %e, "Echo write failed");
                    break;
                }
            }
            Err(TransportError::Interrupted) => continue,
            Err(e) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "Echo read ended");
                break;
            }
        }
    }

    let _ = conn.close().await;
}
