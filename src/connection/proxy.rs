//! Proxy stage
//!
//! The stage only redirects the engine's connect target to the proxy. The
//! proxy protocol exchange (HTTP CONNECT, SOCKS greeting) belongs to a
//! higher layer, typically a connection handler.

use super::template::RemoteAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// HTTP CONNECT tunnel
    Http,
    /// SOCKS4
    Socks4,
    /// SOCKS5
    Socks5,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Socks4 => write!(f, "socks4"),
            Self::Socks5 => write!(f, "socks5"),
        }
    }
}

/// Proxy settings attached to a connection template
///
/// # Examples
///
/// ```ignore
/// let proxy = ProxyOptions::new(ProxyKind::Socks5, "proxy.internal", 1080)
///     .username("svc")
///     .password("secret")
///     .non_proxy_host("*.internal")
///     .non_proxy_host("localhost");
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyOptions {
    kind: ProxyKind,
    host: String,
    port: u16,
    #[serde(default)]
    username: Option<String>,
    #[serde(default, skip_serializing)]
    password: Option<String>,
    #[serde(default)]
    non_proxy_hosts: Vec<String>,
}

impl ProxyOptions {
    /// Proxy of `kind` at `host:port`
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            username: None,
            password: None,
            non_proxy_hosts: Vec::new(),
        }
    }

    /// Set the user name
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Bypass the proxy for hosts matching `pattern`
    ///
    /// Patterns are matched case-insensitively; a leading `*.` matches any
    /// subdomain.
    pub fn non_proxy_host(mut self, pattern: impl Into<String>) -> Self {
        self.non_proxy_hosts.push(pattern.into());
        self
    }

    /// Proxy protocol
    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// Proxy address
    pub fn address(&self) -> RemoteAddress {
        RemoteAddress::from_host(&self.host, self.port)
    }

    /// Configured user name
    pub fn user(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Configured password
    pub fn secret(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Whether connections to `host` go through the proxy
    pub fn should_proxy(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        !self.non_proxy_hosts.iter().any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            match pattern.strip_prefix("*.") {
                Some(suffix) => host == suffix || host.ends_with(&format!(".{}", suffix)),
                None => host == pattern,
            }
        })
    }
}

impl fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("non_proxy_hosts", &self.non_proxy_hosts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_proxy_patterns() {
        let proxy = ProxyOptions::new(ProxyKind::Http, "proxy", 3128)
            .non_proxy_host("*.internal")
            .non_proxy_host("LOCALHOST");

        assert!(!proxy.should_proxy("db.internal"));
        assert!(!proxy.should_proxy("internal"));
        assert!(!proxy.should_proxy("localhost"));
        assert!(proxy.should_proxy("example.com"));
        assert!(proxy.should_proxy("notinternal"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let proxy = ProxyOptions::new(ProxyKind::Socks5, "proxy", 1080)
            .username("svc")
            .password("hunter2");
        let debug = format!("{:?}", proxy);
        assert!(debug.contains("svc"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_deserialize_from_json() {
        let proxy: ProxyOptions = serde_json::from_str(
            r#"{"kind":"socks5","host":"10.1.1.1","port":1080,"non_proxy_hosts":["localhost"]}"#,
        )
        .unwrap();
        assert_eq!(proxy.kind(), ProxyKind::Socks5);
        assert_eq!(proxy.address(), RemoteAddress::Socket("10.1.1.1:1080".parse().unwrap()));
        assert!(!proxy.should_proxy("localhost"));
    }

    #[test]
    fn test_password_is_not_serialized() {
        let proxy = ProxyOptions::new(ProxyKind::Http, "proxy", 8080).password("hunter2");
        let json = serde_json::to_string(&proxy).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
