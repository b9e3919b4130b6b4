//! Connect to a host, optionally over TLS, and print what the peer sends
//!
//! ```bash
//! RUST_LOG=wire_connect=debug cargo run --example connect -- example.com 443 --tls
//! ```

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wire_connect::TcpClient;

#[tokio::main]
async fn main() -> wire_connect::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "localhost".to_string());
    let port = args
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(wire_connect::env::default_port);
    let tls = args.any(|a| a == "--tls");

    let mut client = TcpClient::create()
        .host(host.clone())
        .port(port)
        .wiretap()
        .do_on_connected(|conn| {
            tracing::info!(id = %conn.id(), address = ?conn.address().ok(), "connected");
        })
        .do_on_disconnect(|conn| tracing::info!(id = %conn.id(), "disconnected"));
    if tls {
        client = client.secure();
    }

    let conn = client.connect().await?;
    if let Some(fingerprint) = conn.peer_certificate_fingerprint() {
        let hex: String = fingerprint.iter().map(|b| format!("{:02x}", b)).collect();
        println!("peer certificate sha256: {}", hex);
    }

    if let Some(mut io) = conn.take_io() {
        io.write_all(format!("HEAD / HTTP/1.0\r\nHost: {}\r\n\r\n", host).as_bytes())
            .await?;
        let mut response = Vec::new();
        let read = io.read_to_end(&mut response);
        if tokio::time::timeout(Duration::from_secs(5), read).await.is_err() {
            println!("(no EOF after 5s)");
        }
        println!("{}", String::from_utf8_lossy(&response));
    }

    conn.dispose_now(Duration::from_secs(1)).await
}
