//! Connection management
//!
//! This module handles:
//! * Connection templates (addresses, socket options, attributes, hooks)
//! * TLS contexts and the handshake stage
//! * The lifecycle bridge turning engine events into one outcome
//! * The default tokio engine

mod bridge;
mod channel;
mod conn;
mod proxy;
mod resolver;
mod resources;
mod state;
mod template;
mod tls;
mod transport;
mod wiretap;

pub(crate) use bridge::{launch, Role};
pub use bridge::{CancelHandle, ConnectFuture};
pub use channel::{
    AsyncIo, BoxedIo, Channel, ChannelEvent, ChannelId, ChannelKind, EventSink, EventStream,
    Transport,
};
pub use conn::Connection;
pub use proxy::{ProxyKind, ProxyOptions};
pub use resolver::{AddressResolver, StaticResolver, SystemResolver};
pub use resources::{native_available, ChannelImpl, ChannelPool, LoopResources};
pub use state::LifecycleState;
pub use template::{
    AttributeKey, Attributes, ConnectHook, ConnectionHandler, ConnectionHook, ConnectionTemplate,
    LifecycleHooks, RemoteAddress, SocketOption, SocketOptions,
};
pub use tls::{server_name, RootSource, SslStage, TlsContext, TlsContextBuilder};
pub use transport::{TcpVariant, TokioChannel, TokioTransport};
pub use wiretap::{Wiretap, WiretapIo, CLIENT_CATEGORY, SERVER_CATEGORY};
