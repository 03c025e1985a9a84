use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde_json::json;

use secure_transport::config::TimeoutConfig;
use secure_transport::net::transport::PROTOCOL_VERSION;
use secure_transport::net::{connect, ClientOptions, ClientTlsOptions};
use secure_transport::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "transport-client")]
#[command(about = "Dial a secure-transport listener and report what was negotiated", long_about = None)]
struct Cli {
    /// Listener address.
    addr: SocketAddr,

    /// Use TLS, trusting the given CA file (repeatable).
    #[arg(long = "ca")]
    ca_files: Vec<PathBuf>,

    /// Server name for SNI and certificate verification.
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Application protocols to offer, most preferred first (repeatable).
    #[arg(long = "alpn")]
    protocols: Vec<String>,

    /// Line to send; the reply is printed.
    #[arg(short, long, default_value = "hello")]
    message: String,

    /// Connect and TLS handshake deadline in milliseconds.
    #[arg(long, default_value_t = TimeoutConfig::default().connect_ms)]
    connect_timeout_ms: u64,

    /// Read/write deadline in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging("warn");

    let timeouts = TimeoutConfig {
        connect_ms: cli.connect_timeout_ms,
        socket_ms: cli.timeout_ms,
        ..TimeoutConfig::default()
    };
    let mut options = ClientOptions::from_timeouts(&timeouts);
    if !cli.ca_files.is_empty() {
        options.tls = Some(ClientTlsOptions {
            root_cert_files: cli.ca_files,
            server_name: cli.server_name,
            next_protocols: cli.protocols,
            identity: None,
        });
    }

    let mut conn = connect(cli.addr, &options).await?;

    let line = format!("{}\n", cli.message);
    conn.write(line.as_bytes()).await?;

    let mut reply = Vec::new();
    let mut buf = [0u8; 4096];
    while reply.len() < line.len() {
        let n = conn.read(&mut buf, None).await?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }

    let report = json!({
        "transport": conn.kind().to_string(),
        "negotiated_protocol": conn.negotiated_protocol().map(|p| String::from_utf8_lossy(p).into_owned()),
        "cipher": conn.cipher().map(|c| c.name.clone()),
        "cipher_bits": conn.cipher().map(|c| c.bits),
        "protocol_version": conn.string_attribute(PROTOCOL_VERSION)?,
        "echo": String::from_utf8_lossy(&reply).trim_end(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    conn.close().await?;
    Ok(())
}
