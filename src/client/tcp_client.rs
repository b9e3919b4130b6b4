//! TcpClient implementation

use super::chain::{Chain, Op, SecureSpec};
use crate::connection::{
    launch, AddressResolver, AttributeKey, ChannelPool, ConnectFuture, Connection,
    ConnectionHandler, ConnectionTemplate, LoopResources, ProxyOptions, RemoteAddress, Role,
    SocketOption, TlsContext, TlsContextBuilder, TokioTransport, Transport, Wiretap,
    CLIENT_CATEGORY,
};
use crate::{env, Error, Result};
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// Immutable TCP client configuration
///
/// Every mutator returns a new client and leaves the receiver untouched, so
/// a configured client can be shared and specialised freely. Nothing
/// happens on the network until [`TcpClient::connect`].
///
/// # Examples
///
/// ```ignore
/// use wire_connect::TcpClient;
/// use std::time::Duration;
///
/// let base = TcpClient::create().host("example.com");
/// let https = base.port(443).secure();
///
/// let conn = https.connect().await?;
/// println!("connected to {}", conn.address()?);
/// conn.dispose_now(Duration::from_secs(1)).await?;
/// ```
#[derive(Clone, Default)]
pub struct TcpClient {
    chain: Chain,
}

impl TcpClient {
    /// A client with default settings and no pool
    pub fn create() -> Self {
        Self {
            chain: Chain::new(),
        }
    }

    /// A client whose connections come from (and return to) `pool`
    ///
    /// Pooled connections are persistent: disposing them releases the
    /// channel to the pool instead of closing it.
    pub fn create_pooled(pool: Arc<dyn ChannelPool>) -> Self {
        Self::create().update(move |t| t.set_pool(Some(pool.clone())))
    }

    fn with(&self, op: Op) -> Self {
        Self {
            chain: self.chain.push(op),
        }
    }

    fn update<F>(&self, f: F) -> Self
    where
        F: Fn(&mut ConnectionTemplate) + Send + Sync + 'static,
    {
        self.map_template(move |t| {
            f(t);
            Ok(())
        })
    }

    /// Apply a raw template transformation at configure time.
    ///
    /// An error returned by `f` fails the connect attempt.
    pub fn map_template<F>(&self, f: F) -> Self
    where
        F: Fn(&mut ConnectionTemplate) -> Result<()> + Send + Sync + 'static,
    {
        self.with(Op::Template(Arc::new(f)))
    }

    /// Connect to a fixed socket address
    pub fn remote_address(&self, addr: SocketAddr) -> Self {
        self.update(move |t| t.set_remote(addr))
    }

    /// Compute the remote address on every configure
    pub fn address_supplier<F>(&self, supplier: F) -> Self
    where
        F: Fn() -> SocketAddr + Send + Sync + 'static,
    {
        self.update(move |t| t.set_remote(supplier()))
    }

    /// Replace the remote host, keeping the port.
    ///
    /// # Panics
    ///
    /// Panics if `host` is empty.
    pub fn host(&self, host: impl Into<String>) -> Self {
        let host = host.into();
        assert!(!host.is_empty(), "host must not be empty");
        self.update(move |t| {
            let remote = t.remote().with_host(&host);
            t.set_remote(remote);
        })
    }

    /// Replace the remote port, keeping the host
    pub fn port(&self, port: u16) -> Self {
        self.update(move |t| {
            let remote = t.remote().with_port(port);
            t.set_remote(remote);
        })
    }

    /// Bind the local end to `addr` before connecting
    pub fn bind_address(&self, addr: SocketAddr) -> Self {
        self.update(move |t| t.set_local_address(Some(addr)))
    }

    /// Set a socket option; invalid values fail the connect attempt
    pub fn option(&self, option: SocketOption) -> Self {
        self.map_template(move |t| t.set_option(option))
    }

    /// Copy a typed attribute onto every connection
    pub fn attr<T>(&self, key: AttributeKey<T>, value: T) -> Self
    where
        T: Any + Send + Sync + Clone,
    {
        self.update(move |t| t.insert_attr(key, value.clone()))
    }

    /// Resolve host names with `resolver`
    pub fn resolver(&self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.update(move |t| t.set_resolver(resolver.clone()))
    }

    /// Run connections on `resources`, preferring the native channel
    /// implementation unless disabled through the environment
    pub fn run_on(&self, resources: LoopResources) -> Self {
        self.run_on_with(resources, env::default_prefer_native())
    }

    /// Run connections on `resources` with an explicit channel preference
    pub fn run_on_with(&self, resources: LoopResources, prefer_native: bool) -> Self {
        self.update(move |t| {
            t.set_channel_impl(resources.on_client(prefer_native));
            t.set_resources(Some(resources.clone()));
        })
    }

    /// Enable TLS with the default context and handshake timeout.
    ///
    /// If the default context could not be built the connect attempt fails
    /// with [`Error::Tls`].
    pub fn secure(&self) -> Self {
        let context = TlsContext::default_context()
            .ok_or_else(|| Error::Tls("default TLS context is unavailable".into()));
        self.with(Op::Secure(SecureSpec::new(
            context,
            env::default_ssl_handshake_timeout(),
        )))
    }

    /// Enable TLS with a customised context and the default handshake timeout
    pub fn secure_with<F>(&self, customizer: F) -> Self
    where
        F: FnOnce(TlsContextBuilder) -> TlsContextBuilder,
    {
        self.secure_with_timeout(customizer, env::default_ssl_handshake_timeout())
    }

    /// Enable TLS with a customised context.
    ///
    /// The context is built right away; a build failure fails every later
    /// connect attempt with [`Error::Tls`].
    ///
    /// # Panics
    ///
    /// Panics if `handshake_timeout` is zero.
    pub fn secure_with_timeout<F>(&self, customizer: F, handshake_timeout: Duration) -> Self
    where
        F: FnOnce(TlsContextBuilder) -> TlsContextBuilder,
    {
        assert!(
            !handshake_timeout.is_zero(),
            "TLS handshake timeout must be positive"
        );
        let context = customizer(TlsContext::builder()).build();
        if let Err(err) = &context {
            tracing::debug!(error = %err, "TLS context build failed");
        }
        self.with(Op::Secure(SecureSpec::new(context, handshake_timeout)))
    }

    /// Enable TLS with an explicit context.
    ///
    /// # Panics
    ///
    /// Panics if `handshake_timeout` is zero.
    pub fn secure_context(&self, context: TlsContext, handshake_timeout: Duration) -> Self {
        assert!(
            !handshake_timeout.is_zero(),
            "TLS handshake timeout must be positive"
        );
        self.with(Op::Secure(SecureSpec::new(Ok(context), handshake_timeout)))
    }

    /// Set the SNI name presented during the handshake.
    ///
    /// Applies to the TLS stage in effect after the whole chain resolved, so
    /// a later `secure*()` keeps it. Configuring fails when no TLS stage is
    /// left.
    pub fn server_name(&self, name: impl Into<String>) -> Self {
        let name: String = name.into();
        self.with(Op::ServerName(name.into()))
    }

    /// Remove any TLS stage
    pub fn unsecure(&self) -> Self {
        self.with(Op::Unsecure)
    }

    /// Whether the nearest TLS setting enables TLS
    pub fn is_secure(&self) -> bool {
        self.tls_context().is_some()
    }

    /// TLS context of the nearest TLS setting
    pub fn tls_context(&self) -> Option<TlsContext> {
        self.chain.secure_spec()?.context().cloned()
    }

    /// Route connections through a proxy, replacing any earlier proxy
    pub fn proxy(&self, options: ProxyOptions) -> Self {
        self.update(move |t| t.set_proxy(Some(options.clone())))
    }

    /// Remove any proxy
    pub fn unproxy(&self) -> Self {
        self.update(|t| t.set_proxy(None))
    }

    /// Run `hook` right before each attempt starts
    pub fn do_on_connect<F>(&self, hook: F) -> Self
    where
        F: Fn(&ConnectionTemplate) + Send + Sync + 'static,
    {
        let hook: Arc<dyn Fn(&ConnectionTemplate) + Send + Sync> = Arc::new(hook);
        self.update(move |t| t.hooks_mut().push_connect(hook.clone()))
    }

    /// Run `hook` once each connection is established
    pub fn do_on_connected<F>(&self, hook: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        let hook: Arc<dyn Fn(&Connection) + Send + Sync> = Arc::new(hook);
        self.update(move |t| t.hooks_mut().push_connected(hook.clone()))
    }

    /// Run `hook` once each connection is torn down
    pub fn do_on_disconnect<F>(&self, hook: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        let hook: Arc<dyn Fn(&Connection) + Send + Sync> = Arc::new(hook);
        self.update(move |t| t.hooks_mut().push_disconnect(hook.clone()))
    }

    /// Register connect, connected and disconnect hooks in one node
    pub fn do_on_lifecycle<C, A, D>(&self, on_connect: C, on_connected: A, on_disconnect: D) -> Self
    where
        C: Fn(&ConnectionTemplate) + Send + Sync + 'static,
        A: Fn(&Connection) + Send + Sync + 'static,
        D: Fn(&Connection) + Send + Sync + 'static,
    {
        let on_connect: Arc<dyn Fn(&ConnectionTemplate) + Send + Sync> = Arc::new(on_connect);
        let on_connected: Arc<dyn Fn(&Connection) + Send + Sync> = Arc::new(on_connected);
        let on_disconnect: Arc<dyn Fn(&Connection) + Send + Sync> = Arc::new(on_disconnect);
        self.update(move |t| {
            let hooks = t.hooks_mut();
            hooks.push_connect(on_connect.clone());
            hooks.push_connected(on_connected.clone());
            hooks.push_disconnect(on_disconnect.clone());
        })
    }

    /// Run `handler` on each established connection; the connection is
    /// disposed when the returned future completes
    pub fn handler<F, Fut>(&self, handler: F) -> Self
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: ConnectionHandler =
            Arc::new(move |conn: Connection| -> BoxFuture<'static, Result<()>> {
                Box::pin(handler(conn))
            });
        self.update(move |t| t.set_handler(Some(handler.clone())))
    }

    /// Log wire traffic at debug level under the client category
    pub fn wiretap(&self) -> Self {
        self.wiretap_with(CLIENT_CATEGORY, Level::DEBUG)
    }

    /// Log wire traffic at debug level under `category`.
    ///
    /// # Panics
    ///
    /// Panics if `category` is empty.
    pub fn wiretap_category(&self, category: impl Into<String>) -> Self {
        self.wiretap_with(category, Level::DEBUG)
    }

    /// Log wire traffic at `level` under `category`.
    ///
    /// # Panics
    ///
    /// Panics if `category` is empty.
    pub fn wiretap_with(&self, category: impl Into<String>, level: Level) -> Self {
        let tap = Wiretap::new(category, level);
        self.update(move |t| t.set_wiretap(Some(tap.clone())))
    }

    /// Replace the engine
    pub fn transport(&self, transport: Arc<dyn Transport>) -> Self {
        self.with(Op::Transport(transport))
    }

    /// Resolve the chain into a template
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a node: an invalid socket option,
    /// an unbuildable TLS context or a failing [`TcpClient::map_template`].
    pub fn configure(&self) -> Result<ConnectionTemplate> {
        self.chain.resolve(ConnectionTemplate::client_default())
    }

    /// Start connecting
    ///
    /// Configuration errors are reported through the returned future.
    pub fn connect(&self) -> ConnectFuture {
        match self.configure() {
            Ok(template) => self.connect_with(template),
            Err(err) => {
                tracing::debug!(error = %err, "configuration failed");
                ConnectFuture::failed(err)
            }
        }
    }

    /// Start connecting with an already resolved template
    pub fn connect_with(&self, template: ConnectionTemplate) -> ConnectFuture {
        let transport = self
            .chain
            .transport()
            .unwrap_or_else(|| Arc::new(TokioTransport));
        launch(template, transport, Role::Client)
    }

    /// Remote address the chain currently resolves to
    pub fn remote(&self) -> Result<RemoteAddress> {
        Ok(self.configure()?.remote().clone())
    }
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient")
            .field("nodes", &self.chain.len())
            .field("secure", &self.is_secure())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutators_do_not_touch_receiver() {
        let base = TcpClient::create();
        let derived = base.host("example.com").port(443);

        assert_eq!(base.remote().unwrap().host(), "localhost");
        assert_eq!(derived.remote().unwrap().to_string(), "example.com:443");
    }

    #[test]
    fn test_address_supplier_runs_per_configure() {
        use std::sync::atomic::{AtomicU16, Ordering};
        let next = Arc::new(AtomicU16::new(9000));
        let counter = next.clone();
        let client = TcpClient::create().address_supplier(move || {
            SocketAddr::from(([127, 0, 0, 1], counter.fetch_add(1, Ordering::SeqCst)))
        });

        assert_eq!(client.remote().unwrap().port(), 9000);
        assert_eq!(client.remote().unwrap().port(), 9001);
    }

    #[test]
    #[should_panic(expected = "host must not be empty")]
    fn test_empty_host_panics() {
        let _ = TcpClient::create().host("");
    }

    #[test]
    #[should_panic(expected = "handshake timeout must be positive")]
    fn test_zero_handshake_timeout_panics() {
        let ctx = TlsContext::builder().build().unwrap();
        let _ = TcpClient::create().secure_context(ctx, Duration::ZERO);
    }

    #[test]
    fn test_secure_and_unsecure() {
        let client = TcpClient::create();
        assert!(!client.is_secure());
        assert!(client.secure().is_secure());
        assert!(!client.secure().unsecure().is_secure());
        assert!(client.secure().unsecure().configure().unwrap().tls().is_none());
    }

    #[test]
    fn test_server_name_requires_tls() {
        let err = TcpClient::create().server_name("db").configure().unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let template = TcpClient::create().secure().server_name("db").configure().unwrap();
        assert_eq!(template.tls().unwrap().server_name(), Some("db"));
    }

    #[test]
    fn test_debug_shows_node_count() {
        let client = TcpClient::create().port(1).host("a");
        assert!(format!("{:?}", client).contains("nodes: 2"));
    }
}
