//! TcpServer implementation

use super::chain::{Chain, Op};
use crate::connection::{
    launch, AttributeKey, ConnectFuture, Connection, ConnectionHandler, ConnectionTemplate,
    LoopResources, Role, SocketOption, TokioTransport, Transport, Wiretap, SERVER_CATEGORY,
};
use crate::Result;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Level;

/// Immutable TCP server configuration
///
/// [`TcpServer::bind`] resolves to a [`Connection`] for the listener. Every
/// accepted connection is handed to the [`TcpServer::handler`] on its own
/// task and disposed once the handler finishes; failures of accepted
/// connections never affect the listener.
///
/// # Examples
///
/// ```ignore
/// use tokio::io::AsyncWriteExt;
///
/// let listener = TcpServer::create()
///     .host("127.0.0.1")
///     .port(0)
///     .handler(|conn| async move {
///         if let Some(mut io) = conn.take_io() {
///             io.write_all(b"hello\n").await?;
///         }
///         Ok(())
///     })
///     .bind()
///     .await?;
/// println!("listening on {}", listener.address()?);
/// ```
#[derive(Clone, Default)]
pub struct TcpServer {
    chain: Chain,
}

impl TcpServer {
    /// A server with default settings
    pub fn create() -> Self {
        Self {
            chain: Chain::new(),
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

    /// Apply a raw template transformation at configure time
    pub fn map_template<F>(&self, f: F) -> Self
    where
        F: Fn(&mut ConnectionTemplate) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            chain: self.chain.push(Op::Template(Arc::new(f))),
        }
    }

    /// Listen on a fixed socket address
    pub fn bind_address(&self, addr: SocketAddr) -> Self {
        self.update(move |t| t.set_remote(addr))
    }

    /// Replace the listen host, keeping the port.
    ///
    /// # Panics
    ///
    /// Panics if `host` is empty.
    pub fn host(&self, host: impl Into<String>) -> Self {
        let host = host.into();
        assert!(!host.is_empty(), "host must not be empty");
        self.update(move |t| {
            let listen = t.remote().with_host(&host);
            t.set_remote(listen);
        })
    }

    /// Replace the listen port (0 picks an ephemeral port)
    pub fn port(&self, port: u16) -> Self {
        self.update(move |t| {
            let listen = t.remote().with_port(port);
            t.set_remote(listen);
        })
    }

    /// Set a socket option (applied to the listener and accepted sockets)
    pub fn option(&self, option: SocketOption) -> Self {
        self.map_template(move |t| t.set_option(option))
    }

    /// Copy a typed attribute onto every accepted connection
    pub fn attr<T>(&self, key: AttributeKey<T>, value: T) -> Self
    where
        T: Any + Send + Sync + Clone,
    {
        self.update(move |t| t.insert_attr(key, value.clone()))
    }

    /// Run the listener on `resources`
    pub fn run_on(&self, resources: LoopResources) -> Self {
        self.update(move |t| t.set_resources(Some(resources.clone())))
    }

    /// Run `hook` right before binding
    pub fn do_on_bind<F>(&self, hook: F) -> Self
    where
        F: Fn(&ConnectionTemplate) + Send + Sync + 'static,
    {
        let hook: Arc<dyn Fn(&ConnectionTemplate) + Send + Sync> = Arc::new(hook);
        self.update(move |t| t.hooks_mut().push_connect(hook.clone()))
    }

    /// Run `hook` once the listener is bound
    pub fn do_on_bound<F>(&self, hook: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        let hook: Arc<dyn Fn(&Connection) + Send + Sync> = Arc::new(hook);
        self.update(move |t| t.hooks_mut().push_connected(hook.clone()))
    }

    /// Run `hook` once the listener is closed
    pub fn do_on_unbound<F>(&self, hook: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        let hook: Arc<dyn Fn(&Connection) + Send + Sync> = Arc::new(hook);
        self.update(move |t| t.hooks_mut().push_disconnect(hook.clone()))
    }

    /// Run `handler` on every accepted connection
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

    /// Log wire traffic at debug level under the server category
    pub fn wiretap(&self) -> Self {
        self.wiretap_with(SERVER_CATEGORY, Level::DEBUG)
    }

    /// Log wire traffic at debug level under `category`
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
        Self {
            chain: self.chain.push(Op::Transport(transport)),
        }
    }

    /// Resolve the chain into a template
    pub fn configure(&self) -> Result<ConnectionTemplate> {
        self.chain.resolve(ConnectionTemplate::server_default())
    }

    /// Start listening
    pub fn bind(&self) -> ConnectFuture {
        match self.configure() {
            Ok(template) => self.bind_with(template),
            Err(err) => ConnectFuture::failed(err),
        }
    }

    /// Start listening with an already resolved template
    pub fn bind_with(&self, template: ConnectionTemplate) -> ConnectFuture {
        let transport = self
            .chain
            .transport()
            .unwrap_or_else(|| Arc::new(TokioTransport));
        launch(template, transport, Role::Server)
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("nodes", &self.chain.len())
            .finish()
    }
}
