//! Client and server façades
//!
//! `TcpClient` and `TcpServer` are immutable configuration chains. Every
//! mutator returns a new value; nothing touches the network until
//! `connect()` / `bind()` folds the chain into a `ConnectionTemplate` and
//! hands it to the engine.

mod chain;
mod settings;
mod tcp_client;
mod tcp_server;

pub use settings::{ClientSettings, TlsSettings};
pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;
