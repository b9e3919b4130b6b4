//! Environment-derived defaults
//!
//! Each value is read once per process. Invalid values are logged and the
//! built-in default is used instead.

use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// Default remote/listen port
pub const PORT_VAR: &str = "WIRE_CONNECT_PORT";

/// Default TLS handshake timeout in milliseconds
pub const SSL_HANDSHAKE_TIMEOUT_VAR: &str = "WIRE_CONNECT_SSL_HANDSHAKE_TIMEOUT_MS";

/// Whether the native channel implementation is preferred
pub const NATIVE_VAR: &str = "WIRE_CONNECT_NATIVE";

/// Worker threads of the shared I/O runtime
pub const IO_WORKER_COUNT_VAR: &str = "WIRE_CONNECT_IO_WORKER_COUNT";

const DEFAULT_PORT: u16 = 12012;
const DEFAULT_SSL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default port used when none is configured
pub fn default_port() -> u16 {
    static PORT: OnceLock<u16> = OnceLock::new();
    *PORT.get_or_init(|| parse_value(PORT_VAR, std::env::var(PORT_VAR).ok(), DEFAULT_PORT))
}

/// Default TLS handshake timeout (10 seconds unless overridden)
pub fn default_ssl_handshake_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let millis = parse_value(
            SSL_HANDSHAKE_TIMEOUT_VAR,
            std::env::var(SSL_HANDSHAKE_TIMEOUT_VAR).ok(),
            DEFAULT_SSL_HANDSHAKE_TIMEOUT.as_millis() as u64,
        );
        if millis == 0 {
            tracing::warn!(
                var = SSL_HANDSHAKE_TIMEOUT_VAR,
                "handshake timeout must be positive, using default"
            );
            return DEFAULT_SSL_HANDSHAKE_TIMEOUT;
        }
        Duration::from_millis(millis)
    })
}

/// Whether the native channel implementation is preferred by default
pub fn default_prefer_native() -> bool {
    static NATIVE: OnceLock<bool> = OnceLock::new();
    *NATIVE.get_or_init(|| parse_value(NATIVE_VAR, std::env::var(NATIVE_VAR).ok(), true))
}

/// Worker threads for the shared I/O runtime: max(available cores, 4)
pub fn default_io_worker_count() -> usize {
    static WORKERS: OnceLock<usize> = OnceLock::new();
    *WORKERS.get_or_init(|| {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = parse_value(
            IO_WORKER_COUNT_VAR,
            std::env::var(IO_WORKER_COUNT_VAR).ok(),
            cores.max(4),
        );
        workers.max(1)
    })
}

/// Parse an optional raw value, falling back to `default` when absent or invalid
pub(crate) fn parse_value<T: FromStr>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "invalid environment value, using default");
                default
            }
        },
    }
}
