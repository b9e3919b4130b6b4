//! Execution resources: the I/O runtime and the optional channel pool

use super::channel::Channel;
use super::template::ConnectionTemplate;
use crate::env;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::runtime::{Handle, Runtime};

/// Channel implementation used by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelImpl {
    /// Socket configured before connect (`TcpSocket`), all options honoured
    #[default]
    Native,
    /// Plain `TcpStream::connect`, pre-connect options ignored
    Portable,
}

/// Whether the native channel implementation is available on this platform
pub fn native_available() -> bool {
    cfg!(unix) || cfg!(windows)
}

/// I/O execution pool a connection runs on
#[derive(Clone)]
pub struct LoopResources {
    handle: Handle,
    name: Arc<str>,
}

impl LoopResources {
    /// Run on the runtime behind `handle`
    pub fn from_handle(name: impl Into<Arc<str>>, handle: Handle) -> Self {
        Self {
            handle,
            name: name.into(),
        }
    }

    /// The runtime the caller is running on, if any
    pub fn current() -> Option<Self> {
        Handle::try_current()
            .ok()
            .map(|handle| Self::from_handle("current", handle))
    }

    /// Process-wide runtime, started on first use
    ///
    /// Worker threads are named `wire-connect-io`; their number comes from
    /// [`env::default_io_worker_count`].
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to start the runtime threads.
    pub fn shared() -> Self {
        static SHARED: OnceLock<Runtime> = OnceLock::new();
        let runtime = SHARED.get_or_init(|| {
            let workers = env::default_io_worker_count();
            tracing::debug!(workers, "starting shared I/O runtime");
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(workers)
                .thread_name("wire-connect-io")
                .enable_all()
                .build()
                .unwrap_or_else(|e| panic!("failed to start shared I/O runtime: {}", e))
        });
        Self::from_handle("shared", runtime.handle().clone())
    }

    /// Resources for an attempt with none configured: the current runtime,
    /// else the shared one
    pub fn for_attempt() -> Self {
        Self::current().unwrap_or_else(Self::shared)
    }

    /// Runtime handle
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel implementation to use for clients on these resources
    pub fn on_client(&self, prefer_native: bool) -> ChannelImpl {
        if prefer_native && native_available() {
            ChannelImpl::Native
        } else {
            ChannelImpl::Portable
        }
    }
}

impl fmt::Debug for LoopResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopResources")
            .field("name", &self.name)
            .field("runtime", &self.handle.runtime_flavor())
            .finish()
    }
}

/// Pool of reusable channels
///
/// Eviction and sizing are the pool's business; the bridge only acquires
/// before connecting and releases persistent connections on disposal.
pub trait ChannelPool: Send + Sync + fmt::Debug + 'static {
    /// An idle, still-active channel matching `template`, if any
    fn acquire(&self, template: &ConnectionTemplate) -> Option<Arc<dyn Channel>>;

    /// Return a channel to the pool
    fn release(&self, channel: Arc<dyn Channel>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefer_native_selection() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let resources = LoopResources::from_handle("test", rt.handle().clone());

        assert_eq!(resources.on_client(false), ChannelImpl::Portable);
        if native_available() {
            assert_eq!(resources.on_client(true), ChannelImpl::Native);
        }
    }

    #[tokio::test]
    async fn test_current_inside_runtime() {
        let resources = LoopResources::current().expect("inside a runtime");
        assert_eq!(resources.name(), "current");
        assert_eq!(LoopResources::for_attempt().name(), "current");
    }

    #[test]
    fn test_outside_runtime_uses_shared() {
        assert!(LoopResources::current().is_none());
        let resources = LoopResources::for_attempt();
        assert_eq!(resources.name(), "shared");
        let answer = resources.handle().block_on(async { 6 * 7 });
        assert_eq!(answer, 42);
    }
}
