//! wire-connect: immutable connection chains over tokio
//!
//! A [`TcpClient`] (or [`TcpServer`]) describes how a connection should be
//! built: addressing, socket options, TLS, proxying, pooling and lifecycle
//! callbacks. Calling `connect()` turns that description into exactly one
//! asynchronous attempt whose outcome is reported once through a
//! [`ConnectFuture`].
//!
//! ```ignore
//! use wire_connect::TcpClient;
//!
//! let client = TcpClient::create()
//!     .host("example.com")
//!     .port(443)
//!     .secure()
//!     .do_on_connected(|conn| tracing::info!(id = %conn.id(), "connected"));
//!
//! let conn = client.connect().await?;
//! let io = conn.take_io().expect("fresh connection owns its stream");
//! ```

pub mod client;
pub mod connection;
pub mod env;
pub mod error;
pub mod metrics;

pub use client::{ClientSettings, TcpClient, TcpServer, TlsSettings};
pub use connection::{CancelHandle, ConnectFuture, Connection, ConnectionTemplate, LifecycleState};
pub use error::{Error, ErrorKind, Result};
