//! Reusable client presets
//!
//! A [`ClientSettings`] value is plain data that can live in a JSON file and
//! be layered onto any [`TcpClient`]. Unset fields leave the client as is.

use super::tcp_client::TcpClient;
use crate::connection::{ProxyOptions, SocketOption};
use crate::{env, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client preset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    /// Remote host
    pub host: Option<String>,
    /// Remote port
    pub port: Option<u16>,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// TCP_NODELAY
    pub nodelay: Option<bool>,
    /// SO_KEEPALIVE
    pub keepalive: Option<bool>,
    /// SO_RCVBUF in bytes
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF in bytes
    pub send_buffer_size: Option<usize>,
    /// TLS stage; absent means plain TCP
    pub tls: Option<TlsSettings>,
    /// Proxy stage
    pub proxy: Option<ProxyOptions>,
    /// Wire logging category (debug level)
    pub wiretap: Option<String>,
}

/// TLS part of a preset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSettings {
    /// PEM file with the trusted CA, replaces the root store
    pub ca_cert_path: Option<PathBuf>,
    /// Trust the platform root store instead of the bundled one
    pub native_roots: bool,
    /// ALPN protocols in preference order
    pub alpn: Vec<String>,
    /// SNI override
    pub server_name: Option<String>,
    /// Handshake timeout in milliseconds
    pub handshake_timeout_ms: Option<u64>,
    /// Skip certificate verification (development only)
    pub danger_accept_invalid_certs: bool,
}

impl ClientSettings {
    /// Parse a preset from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid settings: {}", e)))
    }

    /// Read a JSON preset from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read settings {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Serialize back to pretty JSON (proxy passwords are never written)
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize settings: {}", e)))
    }

    /// Layer the preset onto `client`
    ///
    /// Invalid values (an empty host, a zero timeout) are not checked here;
    /// they fail the connect attempt like any other bad option.
    pub fn apply(&self, client: &TcpClient) -> TcpClient {
        let mut client = client.clone();

        if let Some(host) = self.host.as_deref().filter(|h| !h.is_empty()) {
            client = client.host(host);
        }
        if let Some(port) = self.port {
            client = client.port(port);
        }
        if let Some(ms) = self.connect_timeout_ms {
            client = client.option(SocketOption::ConnectTimeout(Duration::from_millis(ms)));
        }
        if let Some(on) = self.nodelay {
            client = client.option(SocketOption::TcpNoDelay(on));
        }
        if let Some(on) = self.keepalive {
            client = client.option(SocketOption::KeepAlive(on));
        }
        if let Some(size) = self.recv_buffer_size {
            client = client.option(SocketOption::ReceiveBufferSize(size));
        }
        if let Some(size) = self.send_buffer_size {
            client = client.option(SocketOption::SendBufferSize(size));
        }
        if let Some(tls) = &self.tls {
            client = tls.apply(client);
        }
        if let Some(proxy) = &self.proxy {
            client = client.proxy(proxy.clone());
        }
        if let Some(category) = self.wiretap.as_deref().filter(|c| !c.is_empty()) {
            client = client.wiretap_category(category);
        }

        client
    }
}

impl TlsSettings {
    fn handshake_timeout(&self) -> Duration {
        match self.handshake_timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            Some(_) => {
                tracing::warn!("handshake_timeout_ms must be positive, using default");
                env::default_ssl_handshake_timeout()
            }
            None => env::default_ssl_handshake_timeout(),
        }
    }

    fn apply(&self, client: TcpClient) -> TcpClient {
        let settings = self.clone();
        let client = client.secure_with_timeout(
            move |mut builder| {
                if let Some(path) = &settings.ca_cert_path {
                    builder = builder.ca_cert_path(path.clone());
                } else if settings.native_roots {
                    builder = builder.native_roots();
                }
                if !settings.alpn.is_empty() {
                    builder = builder.alpn_protocols(settings.alpn.iter().map(|p| p.as_bytes()));
                }
                builder.danger_accept_invalid_certs(settings.danger_accept_invalid_certs)
            },
            self.handshake_timeout(),
        );

        match &self.server_name {
            Some(name) => client.server_name(name.clone()),
            None => client,
        }
    }
}
