//! Connection template: everything one connect or bind attempt needs
//!
//! A template is a plain value. The configuration chain clones the
//! process-wide default and folds its nodes over the clone, so every attempt
//! works on its own copy.

use super::conn::Connection;
use super::proxy::ProxyOptions;
use super::resolver::{AddressResolver, SystemResolver};
use super::resources::{ChannelImpl, ChannelPool, LoopResources};
use super::tls::SslStage;
use super::wiretap::Wiretap;
use crate::{env, Error, Result};
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Hook run right before an attempt is handed to the engine
pub type ConnectHook = Arc<dyn Fn(&ConnectionTemplate) + Send + Sync>;

/// Hook run with a live connection (connected / disconnected)
pub type ConnectionHook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Per-connection operation; the connection is disposed once it finishes
pub type ConnectionHandler = Arc<dyn Fn(Connection) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Where a template points: the peer for clients, the listen address for
/// servers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteAddress {
    /// Resolved socket address
    Socket(SocketAddr),
    /// Host name resolved at connect time
    Host {
        /// Host name
        host: String,
        /// Port
        port: u16,
    },
}

impl RemoteAddress {
    /// Address for `host:port`; IP literals become socket addresses
    pub fn from_host(host: &str, port: u16) -> Self {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        match literal.parse::<IpAddr>() {
            Ok(ip) => RemoteAddress::Socket(SocketAddr::new(ip, port)),
            Err(_) => RemoteAddress::Host {
                host: host.to_string(),
                port,
            },
        }
    }

    /// Host part (IP literal for socket addresses)
    pub fn host(&self) -> String {
        match self {
            RemoteAddress::Socket(addr) => addr.ip().to_string(),
            RemoteAddress::Host { host, .. } => host.clone(),
        }
    }

    /// Port
    pub fn port(&self) -> u16 {
        match self {
            RemoteAddress::Socket(addr) => addr.port(),
            RemoteAddress::Host { port, .. } => *port,
        }
    }

    /// Same port, new host
    pub fn with_host(&self, host: &str) -> Self {
        RemoteAddress::from_host(host, self.port())
    }

    /// Same host, new port
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            RemoteAddress::Socket(addr) => RemoteAddress::Socket(SocketAddr::new(addr.ip(), port)),
            RemoteAddress::Host { host, .. } => RemoteAddress::Host {
                host: host.clone(),
                port,
            },
        }
    }
}

impl From<SocketAddr> for RemoteAddress {
    fn from(addr: SocketAddr) -> Self {
        RemoteAddress::Socket(addr)
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAddress::Socket(addr) => write!(f, "{}", addr),
            RemoteAddress::Host { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// One socket option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Give up connecting after this long
    ConnectTimeout(Duration),
    /// Start reading as soon as the channel is established
    AutoRead(bool),
    /// SO_RCVBUF in bytes
    ReceiveBufferSize(usize),
    /// SO_SNDBUF in bytes
    SendBufferSize(usize),
    /// TCP_NODELAY
    TcpNoDelay(bool),
    /// SO_KEEPALIVE
    KeepAlive(bool),
    /// SO_REUSEADDR
    ReuseAddress(bool),
    /// SO_LINGER (`None` disables lingering)
    Linger(Option<Duration>),
    /// IP_TTL
    Ttl(u32),
    /// Listen backlog
    Backlog(u32),
}

/// Socket options carried by a template; unset options keep the OS default
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptions {
    connect_timeout: Option<Duration>,
    auto_read: bool,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
    nodelay: Option<bool>,
    keepalive: Option<bool>,
    reuse_address: Option<bool>,
    linger: Option<Option<Duration>>,
    ttl: Option<u32>,
    backlog: Option<u32>,
}

impl SocketOptions {
    /// Validate and apply one option.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOption`] for zero timeouts, buffer sizes,
    /// backlogs and TTLs outside 1..=255.
    pub fn set(&mut self, option: SocketOption) -> Result<()> {
        match option {
            SocketOption::ConnectTimeout(timeout) => {
                if timeout.is_zero() {
                    return Err(Error::InvalidOption("connect timeout must be positive".into()));
                }
                self.connect_timeout = Some(timeout);
            }
            SocketOption::AutoRead(on) => self.auto_read = on,
            SocketOption::ReceiveBufferSize(size) => {
                self.recv_buffer_size = Some(positive("receive buffer size", size)?);
            }
            SocketOption::SendBufferSize(size) => {
                self.send_buffer_size = Some(positive("send buffer size", size)?);
            }
            SocketOption::TcpNoDelay(on) => self.nodelay = Some(on),
            SocketOption::KeepAlive(on) => self.keepalive = Some(on),
            SocketOption::ReuseAddress(on) => self.reuse_address = Some(on),
            SocketOption::Linger(linger) => self.linger = Some(linger),
            SocketOption::Ttl(ttl) => {
                if ttl == 0 || ttl > 255 {
                    return Err(Error::InvalidOption(format!("ttl {} out of range 1..=255", ttl)));
                }
                self.ttl = Some(ttl);
            }
            SocketOption::Backlog(backlog) => {
                if backlog == 0 {
                    return Err(Error::InvalidOption("backlog must be positive".into()));
                }
                self.backlog = Some(backlog);
            }
        }
        Ok(())
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Auto-read
    pub fn auto_read(&self) -> bool {
        self.auto_read
    }

    /// SO_RCVBUF
    pub fn recv_buffer_size(&self) -> Option<usize> {
        self.recv_buffer_size
    }

    /// SO_SNDBUF
    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    /// TCP_NODELAY
    pub fn nodelay(&self) -> Option<bool> {
        self.nodelay
    }

    /// SO_KEEPALIVE
    pub fn keepalive(&self) -> Option<bool> {
        self.keepalive
    }

    /// SO_REUSEADDR
    pub fn reuse_address(&self) -> Option<bool> {
        self.reuse_address
    }

    /// SO_LINGER
    pub fn linger(&self) -> Option<Option<Duration>> {
        self.linger
    }

    /// IP_TTL
    pub fn ttl(&self) -> Option<u32> {
        self.ttl
    }

    /// Listen backlog
    pub fn backlog(&self) -> Option<u32> {
        self.backlog
    }
}

fn positive(name: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(Error::InvalidOption(format!("{} must be positive", name)));
    }
    Ok(value)
}

/// Typed attribute key
///
/// # Examples
///
/// ```ignore
/// const TENANT: AttributeKey<String> = AttributeKey::new("tenant");
///
/// let client = TcpClient::create().attr(TENANT, "acme".to_string());
/// let conn = client.connect().await?;
/// assert_eq!(conn.attr(&TENANT).map(String::as_str), Some("acme"));
/// ```
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    /// Key named `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    pub const fn new(name: &'static str) -> Self {
        assert!(!name.is_empty(), "attribute key name must not be empty");
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Key name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeKey({})", self.name)
    }
}

/// Typed attributes copied onto every connection of a template
#[derive(Clone, Default)]
pub struct Attributes {
    values: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    /// Set `key` to `value`, replacing any previous value
    pub fn insert<T: Any + Send + Sync>(&mut self, key: AttributeKey<T>, value: T) {
        self.values.insert(key.name, Arc::new(value));
    }

    /// Value of `key`, if set with the same type
    pub fn get<T: Any + Send + Sync>(&self, key: &AttributeKey<T>) -> Option<&T> {
        self.values.get(key.name)?.downcast_ref::<T>()
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// No attributes set
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.values.keys().collect();
        names.sort();
        f.debug_set().entries(names).finish()
    }
}

/// Lifecycle hooks in registration order
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    on_connect: Vec<ConnectHook>,
    on_connected: Vec<ConnectionHook>,
    on_disconnect: Vec<ConnectionHook>,
}

impl LifecycleHooks {
    /// Hooks run before the attempt starts
    pub fn on_connect(&self) -> &[ConnectHook] {
        &self.on_connect
    }

    /// Hooks run once the connection is established
    pub fn on_connected(&self) -> &[ConnectionHook] {
        &self.on_connected
    }

    /// Hooks run once the connection is torn down
    pub fn on_disconnect(&self) -> &[ConnectionHook] {
        &self.on_disconnect
    }

    pub(crate) fn push_connect(&mut self, hook: ConnectHook) {
        self.on_connect.push(hook);
    }

    pub(crate) fn push_connected(&mut self, hook: ConnectionHook) {
        self.on_connected.push(hook);
    }

    pub(crate) fn push_disconnect(&mut self, hook: ConnectionHook) {
        self.on_disconnect.push(hook);
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_connect", &self.on_connect.len())
            .field("on_connected", &self.on_connected.len())
            .field("on_disconnect", &self.on_disconnect.len())
            .finish()
    }
}

/// Everything one connect or bind attempt needs
#[derive(Clone)]
pub struct ConnectionTemplate {
    remote: RemoteAddress,
    local: Option<SocketAddr>,
    options: SocketOptions,
    attrs: Attributes,
    tls: Option<SslStage>,
    proxy: Option<ProxyOptions>,
    resolver: Arc<dyn AddressResolver>,
    resources: Option<LoopResources>,
    channel_impl: ChannelImpl,
    pool: Option<Arc<dyn ChannelPool>>,
    wiretap: Option<Wiretap>,
    hooks: LifecycleHooks,
    handler: Option<ConnectionHandler>,
}

impl ConnectionTemplate {
    fn empty(remote: RemoteAddress) -> Self {
        Self {
            remote,
            local: None,
            options: SocketOptions::default(),
            attrs: Attributes::default(),
            tls: None,
            proxy: None,
            resolver: Arc::new(SystemResolver),
            resources: None,
            channel_impl: if env::default_prefer_native() {
                ChannelImpl::Native
            } else {
                ChannelImpl::Portable
            },
            pool: None,
            wiretap: None,
            hooks: LifecycleHooks::default(),
            handler: None,
        }
    }

    /// Process-wide client defaults: `localhost:<default port>`, 30 s connect
    /// timeout, auto-read off, 1 MiB receive and send buffers.
    pub fn client_default() -> &'static ConnectionTemplate {
        static CLIENT: OnceLock<ConnectionTemplate> = OnceLock::new();
        CLIENT.get_or_init(|| {
            let mut template =
                ConnectionTemplate::empty(RemoteAddress::from_host("localhost", env::default_port()));
            template.options = SocketOptions {
                connect_timeout: Some(Duration::from_secs(30)),
                auto_read: false,
                recv_buffer_size: Some(1024 * 1024),
                send_buffer_size: Some(1024 * 1024),
                ..SocketOptions::default()
            };
            template
        })
    }

    /// Process-wide server defaults: `0.0.0.0:<default port>`, SO_REUSEADDR,
    /// backlog 1000, TCP_NODELAY.
    pub fn server_default() -> &'static ConnectionTemplate {
        static SERVER: OnceLock<ConnectionTemplate> = OnceLock::new();
        SERVER.get_or_init(|| {
            let listen = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), env::default_port());
            let mut template = ConnectionTemplate::empty(RemoteAddress::Socket(listen));
            template.options = SocketOptions {
                reuse_address: Some(true),
                backlog: Some(1000),
                nodelay: Some(true),
                ..SocketOptions::default()
            };
            template
        })
    }

    /// Peer (client) or listen (server) address
    pub fn remote(&self) -> &RemoteAddress {
        &self.remote
    }

    /// Replace the peer or listen address
    pub fn set_remote(&mut self, remote: impl Into<RemoteAddress>) {
        self.remote = remote.into();
    }

    /// Local bind address for clients
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Set the local bind address
    pub fn set_local_address(&mut self, local: Option<SocketAddr>) {
        self.local = local;
    }

    /// Socket options
    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    /// Validate and apply one socket option
    pub fn set_option(&mut self, option: SocketOption) -> Result<()> {
        self.options.set(option)
    }

    /// Attributes
    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    /// Set an attribute
    pub fn insert_attr<T: Any + Send + Sync>(&mut self, key: AttributeKey<T>, value: T) {
        self.attrs.insert(key, value);
    }

    /// TLS stage
    pub fn tls(&self) -> Option<&SslStage> {
        self.tls.as_ref()
    }

    /// Replace or remove the TLS stage
    pub fn set_tls(&mut self, tls: Option<SslStage>) {
        self.tls = tls;
    }

    /// Proxy stage
    pub fn proxy(&self) -> Option<&ProxyOptions> {
        self.proxy.as_ref()
    }

    /// Replace or remove the proxy stage
    pub fn set_proxy(&mut self, proxy: Option<ProxyOptions>) {
        self.proxy = proxy;
    }

    /// Address the engine actually dials: the proxy when it applies to the
    /// remote host, else the remote address
    pub fn connect_target(&self) -> RemoteAddress {
        match &self.proxy {
            Some(proxy) if proxy.should_proxy(&self.remote.host()) => proxy.address(),
            _ => self.remote.clone(),
        }
    }

    /// Host name resolver
    pub fn resolver(&self) -> &Arc<dyn AddressResolver> {
        &self.resolver
    }

    /// Replace the resolver
    pub fn set_resolver(&mut self, resolver: Arc<dyn AddressResolver>) {
        self.resolver = resolver;
    }

    /// I/O resources, when pinned
    pub fn resources(&self) -> Option<&LoopResources> {
        self.resources.as_ref()
    }

    /// Pin the attempt to `resources`
    pub fn set_resources(&mut self, resources: Option<LoopResources>) {
        self.resources = resources;
    }

    /// Channel implementation
    pub fn channel_impl(&self) -> ChannelImpl {
        self.channel_impl
    }

    /// Select the channel implementation
    pub fn set_channel_impl(&mut self, channel_impl: ChannelImpl) {
        self.channel_impl = channel_impl;
    }

    /// Owning channel pool
    pub fn pool(&self) -> Option<&Arc<dyn ChannelPool>> {
        self.pool.as_ref()
    }

    /// Set the owning pool
    pub fn set_pool(&mut self, pool: Option<Arc<dyn ChannelPool>>) {
        self.pool = pool;
    }

    /// Wire logger
    pub fn wiretap(&self) -> Option<&Wiretap> {
        self.wiretap.as_ref()
    }

    /// Enable or disable wire logging
    pub fn set_wiretap(&mut self, wiretap: Option<Wiretap>) {
        self.wiretap = wiretap;
    }

    /// Lifecycle hooks
    pub fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    pub(crate) fn hooks_mut(&mut self) -> &mut LifecycleHooks {
        &mut self.hooks
    }

    /// Per-connection handler
    pub fn handler(&self) -> Option<&ConnectionHandler> {
        self.handler.as_ref()
    }

    /// Set the per-connection handler
    pub fn set_handler(&mut self, handler: Option<ConnectionHandler>) {
        self.handler = handler;
    }
}

impl fmt::Debug for ConnectionTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTemplate")
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("options", &self.options)
            .field("attrs", &self.attrs)
            .field("tls", &self.tls)
            .field("proxy", &self.proxy)
            .field("resolver", &self.resolver)
            .field("resources", &self.resources)
            .field("channel_impl", &self.channel_impl)
            .field("pool", &self.pool.is_some())
            .field("wiretap", &self.wiretap)
            .field("hooks", &self.hooks)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::proxy::ProxyKind;

    const TENANT: AttributeKey<String> = AttributeKey::new("tenant");
    const RETRIES: AttributeKey<u32> = AttributeKey::new("retries");

    #[test]
    fn test_client_defaults() {
        let template = ConnectionTemplate::client_default();
        assert_eq!(template.remote().host(), "localhost");
        assert_eq!(template.remote().port(), env::default_port());
        assert_eq!(template.options().connect_timeout(), Some(Duration::from_secs(30)));
        assert!(!template.options().auto_read());
        assert_eq!(template.options().recv_buffer_size(), Some(1024 * 1024));
        assert_eq!(template.options().send_buffer_size(), Some(1024 * 1024));
        assert!(template.tls().is_none());
    }

    #[test]
    fn test_server_defaults() {
        let template = ConnectionTemplate::server_default();
        assert_eq!(template.remote().host(), "0.0.0.0");
        assert_eq!(template.options().reuse_address(), Some(true));
        assert_eq!(template.options().backlog(), Some(1000));
        assert_eq!(template.options().nodelay(), Some(true));
    }

    #[test]
    fn test_host_and_port_replacement() {
        let addr = RemoteAddress::from_host("example.com", 80);
        assert_eq!(addr.with_port(443).to_string(), "example.com:443");
        assert_eq!(
            addr.with_host("10.0.0.1"),
            RemoteAddress::Socket("10.0.0.1:80".parse().unwrap())
        );
        assert_eq!(
            RemoteAddress::from_host("[::1]", 8080),
            RemoteAddress::Socket("[::1]:8080".parse().unwrap())
        );
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let mut options = SocketOptions::default();
        assert!(options.set(SocketOption::ConnectTimeout(Duration::ZERO)).is_err());
        assert!(options.set(SocketOption::ReceiveBufferSize(0)).is_err());
        assert!(options.set(SocketOption::SendBufferSize(0)).is_err());
        assert!(options.set(SocketOption::Ttl(256)).is_err());
        assert!(options.set(SocketOption::Backlog(0)).is_err());
        assert_eq!(options, SocketOptions::default());
    }

    #[test]
    fn test_valid_options_apply() {
        let mut options = SocketOptions::default();
        options.set(SocketOption::TcpNoDelay(true)).unwrap();
        options.set(SocketOption::Linger(None)).unwrap();
        options.set(SocketOption::Ttl(64)).unwrap();
        assert_eq!(options.nodelay(), Some(true));
        assert_eq!(options.linger(), Some(None));
        assert_eq!(options.ttl(), Some(64));
    }

    #[test]
    fn test_typed_attributes() {
        let mut attrs = Attributes::default();
        attrs.insert(TENANT, "acme".to_string());
        attrs.insert(RETRIES, 3);

        assert_eq!(attrs.get(&TENANT).map(String::as_str), Some("acme"));
        assert_eq!(attrs.get(&RETRIES), Some(&3));
        assert_eq!(attrs.len(), 2);

        const WRONG_TYPE: AttributeKey<u64> = AttributeKey::new("retries");
        assert!(attrs.get(&WRONG_TYPE).is_none());
    }

    #[test]
    #[should_panic(expected = "attribute key name must not be empty")]
    fn test_empty_attribute_name_panics() {
        let name = String::new();
        let leaked: &'static str = Box::leak(name.into_boxed_str());
        let _ = AttributeKey::<u8>::new(leaked);
    }

    #[test]
    fn test_clone_is_independent() {
        let base = ConnectionTemplate::client_default();
        let mut copy = base.clone();
        copy.set_remote(RemoteAddress::from_host("example.org", 1));
        copy.insert_attr(TENANT, "x".to_string());

        assert_eq!(base.remote().host(), "localhost");
        assert!(base.attrs().is_empty());
    }

    #[test]
    fn test_connect_target_honours_non_proxy_hosts() {
        let mut template = ConnectionTemplate::client_default().clone();
        template.set_remote(RemoteAddress::from_host("db.internal", 5432));
        template.set_proxy(Some(
            ProxyOptions::new(ProxyKind::Http, "10.9.9.9", 3128).non_proxy_host("*.internal"),
        ));
        assert_eq!(template.connect_target().to_string(), "db.internal:5432");

        template.set_remote(RemoteAddress::from_host("example.com", 443));
        assert_eq!(template.connect_target().to_string(), "10.9.9.9:3128");
    }
}
