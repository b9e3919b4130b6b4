//! Host name resolution

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Resolves host names to socket addresses for the engine
pub trait AddressResolver: Send + Sync + fmt::Debug + 'static {
    /// Resolve `host` and pair every address with `port`
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<Vec<SocketAddr>>>;
}

/// System resolver backed by `tokio::net::lookup_host`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl AddressResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<Vec<SocketAddr>>> {
        let host = host.to_string();
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, port)).await?;
            Ok(addrs.collect())
        })
    }
}

/// Fixed host table; unknown hosts fail with `NotFound`
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `host` to `addrs` (ports are replaced by the requested port)
    pub fn with_host(mut self, host: impl Into<String>, addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.entries
            .insert(host.into().to_ascii_lowercase(), addrs.into_iter().collect());
        self
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<Vec<SocketAddr>>> {
        let result = match self.entries.get(&host.to_ascii_lowercase()) {
            Some(addrs) => Ok(addrs
                .iter()
                .map(|addr| SocketAddr::new(addr.ip(), port))
                .collect()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown host '{}'", host),
            )),
        };
        Box::pin(futures::future::ready(result))
    }
}
