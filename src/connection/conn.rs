//! Live connection handle

use super::channel::{BoxedIo, Channel, ChannelId};
use super::resources::ChannelPool;
use super::state::{AtomicState, LifecycleState};
use super::template::{AttributeKey, Attributes};
use crate::metrics::{counters, labels};
use crate::{Error, Result};
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};

type DisposeListener = Box<dyn FnOnce() + Send>;

/// A live connection
///
/// Cheap to clone; clones share state. A connection produced by
/// `TcpClient::connect` is supervised by its lifecycle bridge: disposal is
/// requested here and carried out by the bridge, which fires the disconnect
/// hooks once the channel is inactive. Connections accepted by a listener
/// are detached and tear themselves down.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    channel: Arc<dyn Channel>,
    state: AtomicState,
    persistent: AtomicBool,
    dispose_requested: AtomicBool,
    dispose_signal: Notify,
    terminated: watch::Sender<bool>,
    listeners: Mutex<Option<Vec<DisposeListener>>>,
    attrs: Attributes,
    pool: Option<Arc<dyn ChannelPool>>,
    supervised: bool,
}

impl Connection {
    fn new(
        channel: Arc<dyn Channel>,
        attrs: Attributes,
        pool: Option<Arc<dyn ChannelPool>>,
        supervised: bool,
    ) -> Self {
        let (terminated, _) = watch::channel(false);
        let persistent = pool.is_some();
        Self {
            inner: Arc::new(Inner {
                channel,
                state: AtomicState::new(LifecycleState::Active),
                persistent: AtomicBool::new(persistent),
                dispose_requested: AtomicBool::new(false),
                dispose_signal: Notify::new(),
                terminated,
                listeners: Mutex::new(Some(Vec::new())),
                attrs,
                pool,
                supervised,
            }),
        }
    }

    /// Connection driven by a lifecycle bridge
    pub(crate) fn supervised(
        channel: Arc<dyn Channel>,
        attrs: Attributes,
        pool: Option<Arc<dyn ChannelPool>>,
    ) -> Self {
        Self::new(channel, attrs, pool, true)
    }

    /// Connection that tears itself down (accepted children)
    pub(crate) fn detached(channel: Arc<dyn Channel>, attrs: Attributes) -> Self {
        Self::new(channel, attrs, None, false)
    }

    /// Channel identifier
    pub fn id(&self) -> ChannelId {
        self.inner.channel.id()
    }

    /// Underlying engine channel
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.inner.channel
    }

    /// Address this connection is known by.
    ///
    /// Stream sockets report the remote peer, listeners and datagram
    /// sockets their bound address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressNotApplicable`] for other channel kinds.
    pub fn address(&self) -> Result<SocketAddr> {
        self.inner.channel.kind().address()
    }

    /// Lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.inner.state.load()
    }

    /// Whether the connection reached a terminal state or its channel closed
    pub fn is_disposed(&self) -> bool {
        self.state().is_terminal() || !self.inner.channel.is_active()
    }

    /// Whether disposal hands the channel back to its pool instead of closing it
    pub fn is_persistent(&self) -> bool {
        self.inner.persistent.load(Ordering::Acquire)
    }

    /// Mark the connection persistent (or not)
    pub fn mark_persistent(&self, persistent: bool) -> &Self {
        self.inner.persistent.store(persistent, Ordering::Release);
        self
    }

    /// Attribute copied from the template
    pub fn attr<T: Any + Send + Sync>(&self, key: &AttributeKey<T>) -> Option<&T> {
        self.inner.attrs.get(key)
    }

    /// Byte stream of the connection; `None` while already taken, after
    /// close, or when the channel has none. Disposal closes it underneath.
    pub fn take_io(&self) -> Option<BoxedIo> {
        self.inner.channel.take_io()
    }

    /// SHA-256 of the peer certificate for TLS connections
    pub fn peer_certificate_fingerprint(&self) -> Option<Vec<u8>> {
        self.inner.channel.peer_certificate_fingerprint()
    }

    /// Run `listener` once the connection is torn down.
    ///
    /// Runs immediately if that already happened.
    pub fn on_dispose<F>(&self, listener: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(listeners) => listeners.push(Box::new(listener)),
            None => {
                drop(guard);
                listener();
            }
        }
        self
    }

    /// Request teardown. Idempotent; returns immediately.
    ///
    /// Persistent connections are released to their pool (or left open when
    /// there is none) rather than closed.
    pub fn dispose(&self) {
        if self
            .inner
            .dispose_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if self.inner.supervised {
            self.inner.dispose_signal.notify_one();
            return;
        }

        let teardown = self.release_or_close();
        self.terminate(LifecycleState::Disposed);
        counters::connection_disposed(teardown);
    }

    /// Request teardown and wait until it completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if teardown did not finish within `timeout`.
    pub async fn dispose_now(&self, timeout: Duration) -> Result<()> {
        self.dispose();
        tokio::time::timeout(timeout, self.terminated())
            .await
            .map_err(|_| Error::Timeout {
                operation: "dispose",
                timeout,
            })
    }

    /// Resolves once the connection was torn down
    pub async fn terminated(&self) {
        let mut rx = self.inner.terminated.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Resolves once disposal was requested
    pub(crate) async fn dispose_requested(&self) {
        loop {
            let notified = self.inner.dispose_signal.notified();
            if self.inner.dispose_requested.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Release to the pool when persistent, else close the channel
    pub(crate) fn release_or_close(&self) -> &'static str {
        if self.is_persistent() {
            if let Some(pool) = &self.inner.pool {
                tracing::debug!(channel = %self.id(), "releasing connection to pool");
                pool.release(self.inner.channel.clone());
            }
            labels::TEARDOWN_RELEASED
        } else {
            self.inner.channel.close();
            labels::TEARDOWN_CLOSED
        }
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        self.inner.state.store(state);
    }

    /// Record the terminal state and notify dispose listeners (once)
    pub(crate) fn terminate(&self, state: LifecycleState) {
        self.inner.dispose_requested.store(true, Ordering::Release);
        self.inner.state.store(state);
        self.inner.terminated.send_replace(true);

        let listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for listener in listeners.into_iter().flatten() {
            listener();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("channel", &self.inner.channel)
            .field("state", &self.state())
            .field("persistent", &self.is_persistent())
            .field("supervised", &self.inner.supervised)
            .finish()
    }
}
