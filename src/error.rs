//! Error types

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by configuration, connect attempts and live connections
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration (bad address, unusable default, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// A socket option carried an invalid value
    #[error("invalid socket option: {0}")]
    InvalidOption(String),

    /// TLS context could not be built
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Host name resolution failed
    #[error("failed to resolve '{host}': {source}")]
    Resolve {
        /// Host that was being resolved
        host: String,
        /// Underlying resolver error
        #[source]
        source: io::Error,
    },

    /// The engine could not establish the connection
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Target address
        addr: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The connect timeout elapsed before the socket was established
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target address
        addr: String,
        /// Configured connect timeout
        timeout: Duration,
    },

    /// The peer reset the connection
    #[error("connection reset by peer")]
    ConnectionReset(#[source] io::Error),

    /// The channel closed before the connection was established
    #[error("connection closed before it was established")]
    ConnectionClosed,

    /// TLS handshake did not complete within the configured timeout
    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// The channel kind has no meaningful socket address
    #[error("address not applicable to {0} channel")]
    AddressNotApplicable(&'static str),

    /// Invalid lifecycle transition
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidState {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// The engine does not support the requested operation
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The connect attempt was cancelled before it completed
    #[error("connect attempt cancelled")]
    Cancelled,

    /// Waiting for an operation exceeded the caller's deadline
    #[error("timed out waiting for {operation} after {timeout:?}")]
    Timeout {
        /// Operation being awaited
        operation: &'static str,
        /// Deadline
        timeout: Duration,
    },

    /// I/O error not covered by a more specific variant
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Configuration or TLS context problem
    Config,
    /// Connect failure (refused, unreachable, timeout, closed early)
    Connect,
    /// Abrupt teardown by the peer
    ConnectionReset,
    /// TLS handshake failure
    Handshake,
    /// TLS handshake timeout
    HandshakeTimeout,
    /// Programming error (address of an unsupported channel, unsupported op)
    Usage,
    /// Cancelled by the caller
    Cancelled,
    /// Caller-side wait timed out
    Timeout,
    /// Other I/O error
    Io,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::InvalidOption(_) | Error::Tls(_) => ErrorKind::Config,
            Error::Resolve { .. }
            | Error::Connect { .. }
            | Error::ConnectTimeout { .. }
            | Error::ConnectionClosed => ErrorKind::Connect,
            Error::ConnectionReset(_) => ErrorKind::ConnectionReset,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::HandshakeTimeout(_) => ErrorKind::HandshakeTimeout,
            Error::AddressNotApplicable(_) | Error::Unsupported(_) | Error::InvalidState { .. } => {
                ErrorKind::Usage
            }
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// True when the peer tore the connection down abruptly
    pub fn is_connection_reset(&self) -> bool {
        self.kind() == ErrorKind::ConnectionReset
    }

    /// Map a raw engine I/O error, singling out resets and broken pipes
    pub fn classify_io(err: io::Error) -> Error {
        if is_reset(&err) {
            Error::ConnectionReset(err)
        } else {
            Error::Io(err)
        }
    }

    /// Map an I/O error raised while connecting to `addr`
    pub(crate) fn connect(addr: impl ToString, err: io::Error) -> Error {
        if is_reset(&err) {
            Error::ConnectionReset(err)
        } else {
            Error::Connect {
                addr: addr.to_string(),
                source: err,
            }
        }
    }

    /// Short label for metrics
    pub(crate) fn metric_label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Config => "config",
            ErrorKind::Connect => "connect",
            ErrorKind::ConnectionReset => "reset",
            ErrorKind::Handshake => "handshake",
            ErrorKind::HandshakeTimeout => "handshake_timeout",
            ErrorKind::Usage => "usage",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Io => "io",
        }
    }
}

fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}
