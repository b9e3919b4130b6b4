//! Lifecycle bridge: engine events in, exactly one outcome out
//!
//! One driver task per attempt consumes the engine's [`EventStream`] in
//! order, fulfils the [`ConnectFuture`] at most once and then supervises the
//! live connection until it is torn down.

use super::channel::{Channel, ChannelEvent, EventStream, Transport};
use super::conn::Connection;
use super::resources::LoopResources;
use super::state::LifecycleState;
use super::template::ConnectionTemplate;
use crate::metrics::{counters, histograms, labels};
use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::Instrument;

/// Which side of the connection the attempt represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::Client => labels::ROLE_CLIENT,
            Role::Server => labels::ROLE_SERVER,
        }
    }
}

/// State shared by the driver, the future and cancel handles
#[derive(Debug)]
struct Shared {
    role: Role,
    completed: AtomicBool,
    established: OnceLock<Connection>,
}

impl Shared {
    fn new(role: Role) -> Self {
        Self {
            role,
            completed: AtomicBool::new(false),
            established: OnceLock::new(),
        }
    }

    /// Make `conn` visible to cancel handles, then try to win the outcome.
    ///
    /// Publishing first means a cancel that loses the race always finds the
    /// connection to dispose.
    fn publish(&self, conn: &Connection) -> bool {
        let _ = self.established.set(conn.clone());
        self.try_complete()
    }

    /// Win the right to deliver the single outcome
    fn try_complete(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Cancel before completion, or dispose what was established
    fn cancel(&self, driver: &AbortHandle) -> bool {
        if self.try_complete() {
            driver.abort();
            counters::connect_completed(self.role.label(), labels::RESULT_CANCELLED);
            tracing::debug!(role = self.role.label(), "connect attempt cancelled");
            return true;
        }
        if let Some(conn) = self.established.get() {
            conn.dispose();
        }
        false
    }
}

/// Start an attempt: fire on-connect hooks, hand the template to the engine
/// and spawn the driver on the template's runtime
pub(crate) fn launch(
    template: ConnectionTemplate,
    transport: Arc<dyn Transport>,
    role: Role,
) -> ConnectFuture {
    let resources = template
        .resources()
        .cloned()
        .unwrap_or_else(LoopResources::for_attempt);
    let handle = resources.handle().clone();

    for hook in template.hooks().on_connect() {
        hook(&template);
    }

    let span = tracing::info_span!(
        "connect",
        role = role.label(),
        remote = %template.remote(),
        secure = template.tls().is_some()
    );

    let events = {
        let _enter = handle.enter();
        let pooled = match role {
            Role::Client => template.pool().and_then(|pool| pool.acquire(&template)),
            Role::Server => None,
        };
        match (pooled, role) {
            (Some(channel), _) => {
                tracing::debug!(parent: &span, channel = %channel.id(), "reusing pooled channel");
                EventStream::established(channel)
            }
            (None, Role::Client) => transport.connect(&template),
            (None, Role::Server) => transport.bind(&template),
        }
    };
    counters::connect_attempted(role.label());

    let shared = Arc::new(Shared::new(role));
    let (tx, rx) = oneshot::channel();
    let driver = LifecycleDriver {
        template,
        role,
        shared: shared.clone(),
        tx: Some(tx),
        state: LifecycleState::Pending,
        conn: None,
        started: Instant::now(),
        dispose_handled: false,
    };
    let driver = handle.spawn(driver.run(events).instrument(span));

    ConnectFuture {
        state: FutureState::Pending {
            rx,
            driver,
            shared,
            resources,
            finished: false,
        },
    }
}

struct LifecycleDriver {
    template: ConnectionTemplate,
    role: Role,
    shared: Arc<Shared>,
    tx: Option<oneshot::Sender<Result<Connection>>>,
    state: LifecycleState,
    conn: Option<Connection>,
    started: Instant,
    dispose_handled: bool,
}

impl LifecycleDriver {
    async fn run(mut self, mut events: EventStream) {
        loop {
            let conn = self.conn.clone();
            let watch_dispose = conn.is_some() && !self.dispose_handled;

            let flow = tokio::select! {
                event = events.next() => match event {
                    Some(event) => self.on_event(event),
                    None => self.on_closed(),
                },
                _ = wait_for_dispose(conn.as_ref()), if watch_dispose => self.on_dispose_requested(),
            };
            if flow.is_break() {
                break;
            }
        }
    }

    fn on_event(&mut self, event: ChannelEvent) -> ControlFlow<()> {
        match event {
            ChannelEvent::Established(channel) => self.on_established(channel),
            ChannelEvent::ChildEstablished(child) => self.on_child(child),
            ChannelEvent::Error(err) => self.on_error(err),
            ChannelEvent::Closed => self.on_closed(),
        }
    }

    fn on_established(&mut self, channel: Arc<dyn Channel>) -> ControlFlow<()> {
        if self.state != LifecycleState::Pending {
            counters::duplicate_established(self.role.label());
            tracing::debug!(channel = %channel.id(), state = %self.state, "ignoring duplicate established signal");
            if self.conn.as_ref().map(Connection::id) != Some(channel.id()) {
                channel.close();
            }
            return ControlFlow::Continue(());
        }

        let conn = Connection::supervised(
            channel,
            self.template.attrs().clone(),
            self.template.pool().cloned(),
        );

        if !self.shared.publish(&conn) {
            tracing::debug!(channel = %conn.id(), "established after cancellation, disposing");
            let teardown = conn.release_or_close();
            conn.terminate(LifecycleState::Disposed);
            counters::connection_disposed(teardown);
            return ControlFlow::Break(());
        }

        let _ = self.state.transition(LifecycleState::Active);
        conn.set_state(LifecycleState::Active);
        self.conn = Some(conn.clone());
        self.record_outcome(labels::RESULT_OK);
        tracing::debug!(channel = %conn.id(), address = ?conn.address().ok(), "connection established");

        if let Some(tx) = self.tx.take() {
            if tx.send(Ok(conn.clone())).is_err() {
                tracing::debug!(channel = %conn.id(), "caller went away before receiving the connection");
                conn.dispose();
            }
        }

        let template = &self.template;
        let started = std::panic::catch_unwind(AssertUnwindSafe(|| {
            for hook in template.hooks().on_connected() {
                hook(&conn);
            }
            template.handler().map(|handler| handler(conn.clone()))
        }));
        match started {
            Ok(Some(operation)) => spawn_handler(conn, operation),
            Ok(None) => {}
            Err(payload) => {
                tracing::error!(channel = %conn.id(), "connected hook panicked, tearing connection down");
                conn.channel().close();
                self.finish(LifecycleState::Failed, labels::TEARDOWN_FAILED);
                std::panic::resume_unwind(payload);
            }
        }
        ControlFlow::Continue(())
    }

    fn on_child(&mut self, child: Arc<dyn Channel>) -> ControlFlow<()> {
        if self.role != Role::Server || self.state != LifecycleState::Active {
            tracing::debug!(channel = %child.id(), "ignoring child outside an active listener");
            child.close();
            return ControlFlow::Continue(());
        }

        counters::child_accepted();
        let conn = Connection::detached(child, self.template.attrs().clone());
        tracing::debug!(channel = %conn.id(), peer = ?conn.address().ok(), "accepted connection");

        match self.template.handler() {
            Some(handler) => {
                let started = std::panic::catch_unwind(AssertUnwindSafe(|| handler(conn.clone())));
                let operation = match started {
                    Ok(operation) => operation,
                    Err(payload) => {
                        conn.dispose();
                        std::panic::resume_unwind(payload);
                    }
                };
                spawn_handler(conn, operation);
            }
            None => {
                tracing::debug!(channel = %conn.id(), "no handler configured, closing accepted connection");
                conn.dispose();
            }
        }
        ControlFlow::Continue(())
    }

    fn on_error(&mut self, err: Error) -> ControlFlow<()> {
        match (self.state, self.role) {
            (LifecycleState::Pending, _) => self.fail_pending(err),
            (LifecycleState::Active, Role::Server) => {
                if err.is_connection_reset() {
                    tracing::debug!(error = %err, "connection reset on listener");
                } else {
                    tracing::error!(error = %err, "listener failure while no child connection was present");
                }
                counters::listener_error(err.metric_label());
                ControlFlow::Continue(())
            }
            (LifecycleState::Active, Role::Client) => {
                log_failure(&err, "connection failed");
                if let Some(conn) = self.conn.clone() {
                    conn.channel().close();
                    self.finish(LifecycleState::Failed, labels::TEARDOWN_FAILED);
                }
                ControlFlow::Break(())
            }
            _ => ControlFlow::Break(()),
        }
    }

    fn on_closed(&mut self) -> ControlFlow<()> {
        match self.state {
            LifecycleState::Pending => self.fail_pending(Error::ConnectionClosed),
            LifecycleState::Active => {
                tracing::debug!("channel closed");
                if let Some(conn) = self.conn.clone() {
                    if conn.channel().is_active() {
                        conn.channel().close();
                    }
                }
                self.finish(LifecycleState::Disposed, labels::TEARDOWN_CLOSED);
                ControlFlow::Break(())
            }
            _ => ControlFlow::Break(()),
        }
    }

    fn on_dispose_requested(&mut self) -> ControlFlow<()> {
        self.dispose_handled = true;
        let Some(conn) = self.conn.clone() else {
            return ControlFlow::Continue(());
        };

        let teardown = conn.release_or_close();
        if teardown == labels::TEARDOWN_RELEASED || !conn.channel().is_active() {
            self.finish(LifecycleState::Disposed, teardown);
            return ControlFlow::Break(());
        }
        // Wait for the engine to confirm the close
        ControlFlow::Continue(())
    }

    fn fail_pending(&mut self, err: Error) -> ControlFlow<()> {
        let _ = self.state.transition(LifecycleState::Failed);
        log_failure(&err, "connect failed");

        if !self.shared.try_complete() {
            tracing::debug!(error = %err, "failure after cancellation");
            return ControlFlow::Break(());
        }
        counters::connect_failed(self.role.label(), err.metric_label());
        self.record_outcome(labels::RESULT_ERROR);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
        ControlFlow::Break(())
    }

    /// Terminal transition of a live connection: disconnect hooks, then
    /// dispose listeners, each exactly once
    fn finish(&mut self, next: LifecycleState, teardown: &'static str) {
        let _ = self.state.transition(next);
        if let Some(conn) = self.conn.as_ref() {
            conn.set_state(next);
            for hook in self.template.hooks().on_disconnect() {
                hook(conn);
            }
            conn.terminate(next);
        }
        counters::connection_disposed(teardown);
        tracing::debug!(state = %next, teardown, "connection terminated");
    }

    fn record_outcome(&self, result: &'static str) {
        counters::connect_completed(self.role.label(), result);
        histograms::connect_duration(
            self.role.label(),
            result,
            self.started.elapsed().as_millis() as u64,
        );
    }
}

/// Run a connection handler; the connection is disposed however it ends
fn spawn_handler(conn: Connection, operation: BoxFuture<'static, Result<()>>) {
    tokio::spawn(
        async move {
            match AssertUnwindSafe(operation).catch_unwind().await {
                Ok(Ok(())) => conn.dispose(),
                Ok(Err(err)) => {
                    log_failure(&err, "connection handler failed");
                    conn.dispose();
                }
                Err(payload) => {
                    tracing::error!(channel = %conn.id(), "connection handler panicked");
                    conn.dispose();
                    std::panic::resume_unwind(payload);
                }
            }
        }
        .in_current_span(),
    );
}

async fn wait_for_dispose(conn: Option<&Connection>) {
    match conn {
        Some(conn) => conn.dispose_requested().await,
        None => futures::future::pending().await,
    }
}

/// Resets are routine and logged at debug; anything else is a failure
fn log_failure(err: &Error, message: &'static str) {
    if err.is_connection_reset() {
        tracing::debug!(error = %err, "{}: connection reset by peer", message);
    } else {
        tracing::error!(error = %err, kind = ?err.kind(), "{}", message);
    }
}

/// Pending outcome of a connect or bind attempt
///
/// Resolves exactly once with the established [`Connection`] or the
/// failure. Dropping the future before it resolves cancels the attempt and
/// aborts the engine; a connection that raced the drop is disposed.
#[must_use = "dropping the future cancels the attempt"]
pub struct ConnectFuture {
    state: FutureState,
}

enum FutureState {
    Failed(Option<Error>),
    Pending {
        rx: oneshot::Receiver<Result<Connection>>,
        driver: JoinHandle<()>,
        shared: Arc<Shared>,
        resources: LoopResources,
        finished: bool,
    },
}

impl ConnectFuture {
    /// An attempt that failed before reaching the engine
    pub(crate) fn failed(err: Error) -> Self {
        Self {
            state: FutureState::Failed(Some(err)),
        }
    }

    /// Handle that can cancel the attempt from elsewhere
    pub fn cancel_handle(&self) -> CancelHandle {
        match &self.state {
            FutureState::Failed(_) => CancelHandle { inner: None },
            FutureState::Pending { driver, shared, .. } => CancelHandle {
                inner: Some((shared.clone(), driver.abort_handle())),
            },
        }
    }

    /// Block the calling thread until the outcome is known.
    ///
    /// Must not be called from within an async context.
    pub fn block(self) -> Result<Connection> {
        futures::executor::block_on(self)
    }

    /// Block the calling thread for at most `timeout`.
    ///
    /// On timeout the attempt is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when no outcome arrived in time.
    pub fn block_timeout(self, timeout: Duration) -> Result<Connection> {
        let handle = match &self.state {
            FutureState::Failed(_) => return self.block(),
            FutureState::Pending { resources, .. } => resources.handle().clone(),
        };
        let _enter = handle.enter();
        futures::executor::block_on(tokio::time::timeout(timeout, self)).unwrap_or(Err(
            Error::Timeout {
                operation: "connect",
                timeout,
            },
        ))
    }
}

impl Future for ConnectFuture {
    type Output = Result<Connection>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            FutureState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(Error::Cancelled))),
            FutureState::Pending {
                rx,
                driver,
                finished,
                ..
            } => {
                if *finished {
                    return Poll::Ready(Err(Error::Cancelled));
                }
                match Pin::new(rx).poll(cx) {
                    Poll::Ready(Ok(outcome)) => {
                        *finished = true;
                        Poll::Ready(outcome)
                    }
                    // The driver ended without delivering: cancelled or panicked
                    Poll::Ready(Err(_)) => match Pin::new(driver).poll(cx) {
                        Poll::Ready(Err(err)) if err.is_panic() => {
                            *finished = true;
                            std::panic::resume_unwind(err.into_panic())
                        }
                        Poll::Ready(_) => {
                            *finished = true;
                            Poll::Ready(Err(Error::Cancelled))
                        }
                        Poll::Pending => Poll::Pending,
                    },
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl Drop for ConnectFuture {
    fn drop(&mut self) {
        let FutureState::Pending {
            rx,
            driver,
            shared,
            finished,
            ..
        } = &mut self.state
        else {
            return;
        };
        if *finished {
            return;
        }
        if shared.cancel(&driver.abort_handle()) {
            return;
        }
        rx.close();
        if let Ok(Ok(conn)) = rx.try_recv() {
            tracing::debug!(channel = %conn.id(), "connect future dropped, disposing connection");
            conn.dispose();
        }
    }
}

impl fmt::Debug for ConnectFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            FutureState::Failed(err) => f.debug_tuple("ConnectFuture::Failed").field(err).finish(),
            FutureState::Pending {
                shared, resources, ..
            } => f
                .debug_struct("ConnectFuture")
                .field("role", &shared.role)
                .field("completed", &shared.is_completed())
                .field("resources", resources)
                .finish(),
        }
    }
}

/// Cancels a pending attempt from another task
#[derive(Clone)]
pub struct CancelHandle {
    inner: Option<(Arc<Shared>, AbortHandle)>,
}

impl CancelHandle {
    /// Cancel the attempt.
    ///
    /// Returns true if the attempt was still pending and is now cancelled;
    /// its future resolves with [`Error::Cancelled`]. After establishment
    /// this disposes the connection and returns false.
    pub fn cancel(&self) -> bool {
        match &self.inner {
            Some((shared, driver)) => shared.cancel(driver),
            None => false,
        }
    }

    /// Whether the attempt already has its outcome
    pub fn is_completed(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |(shared, _)| shared.is_completed())
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_completion() {
        let shared = Shared::new(Role::Client);
        assert!(shared.try_complete());
        assert!(!shared.try_complete());
        assert!(shared.is_completed());
    }

    #[derive(Debug)]
    struct StubChannel {
        id: crate::connection::ChannelId,
        active: AtomicBool,
    }

    impl Channel for StubChannel {
        fn id(&self) -> crate::connection::ChannelId {
            self.id
        }

        fn kind(&self) -> crate::connection::ChannelKind {
            crate::connection::ChannelKind::Unsupported("stub")
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.active.store(false, Ordering::SeqCst);
        }
    }

    fn stub_connection() -> Connection {
        let channel = Arc::new(StubChannel {
            id: crate::connection::ChannelId::next(),
            active: AtomicBool::new(true),
        });
        Connection::detached(channel, Default::default())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_racing_publish_never_loses_the_connection() {
        for _ in 0..500 {
            let shared = Arc::new(Shared::new(Role::Client));
            let driver = tokio::spawn(futures::future::pending::<()>());
            let abort = driver.abort_handle();
            let conn = stub_connection();

            let canceller = {
                let shared = shared.clone();
                std::thread::spawn(move || shared.cancel(&abort))
            };
            let published = shared.publish(&conn);
            let cancelled = canceller.join().unwrap();

            // Exactly one side wins; if publishing won, the cancel disposed
            assert_ne!(published, cancelled);
            if published {
                assert!(conn.is_disposed());
            }
            driver.abort();
        }
    }

    #[tokio::test]
    async fn test_failed_future_resolves_with_error() {
        let fut = ConnectFuture::failed(Error::Tls("no roots".into()));
        assert!(fut.cancel_handle().is_completed());
        assert!(!fut.cancel_handle().cancel());
        let err = fut.await.unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn test_failed_future_blocks_without_runtime() {
        let err = ConnectFuture::failed(Error::ConnectionClosed).block().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
