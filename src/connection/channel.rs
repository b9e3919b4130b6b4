//! Engine-facing contracts: channels, their raw event stream and the transport
//!
//! A [`Transport`] turns a [`ConnectionTemplate`] into an [`EventStream`] of
//! [`ChannelEvent`]s. The lifecycle bridge consumes that stream; dropping the
//! stream aborts whatever the engine still has in flight.

use super::template::ConnectionTemplate;
use crate::{Error, Result};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Byte stream handed out by a channel once it is established
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed byte stream
pub type BoxedIo = Box<dyn AsyncIo>;

/// Process-unique channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// What kind of socket backs a channel, with the addresses it knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Point-to-point stream socket
    Socket {
        /// Local end
        local: SocketAddr,
        /// Remote peer
        peer: SocketAddr,
    },
    /// Listening (accepting) socket
    Listener {
        /// Bound address
        local: SocketAddr,
    },
    /// Connectionless datagram socket
    Datagram {
        /// Bound address
        local: SocketAddr,
    },
    /// Anything else (in-memory pipes, unix sockets, ...)
    Unsupported(&'static str),
}

impl ChannelKind {
    /// The address a connection on this channel is known by
    ///
    /// Stream sockets report their peer, listeners and datagram sockets their
    /// bound address. Other kinds have no applicable address.
    pub fn address(&self) -> Result<SocketAddr> {
        match self {
            ChannelKind::Socket { peer, .. } => Ok(*peer),
            ChannelKind::Listener { local } => Ok(*local),
            ChannelKind::Datagram { local } => Ok(*local),
            ChannelKind::Unsupported(name) => Err(Error::AddressNotApplicable(name)),
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Socket { .. } => "socket",
            ChannelKind::Listener { .. } => "listener",
            ChannelKind::Datagram { .. } => "datagram",
            ChannelKind::Unsupported(name) => name,
        }
    }
}

/// A live engine channel
///
/// Implementations must flip [`Channel::is_active`] to false as soon as
/// [`Channel::close`] is called, and should then report
/// [`ChannelEvent::Closed`] on their event stream.
pub trait Channel: Send + Sync + fmt::Debug + 'static {
    /// Channel identifier
    fn id(&self) -> ChannelId;

    /// Socket kind and addresses
    fn kind(&self) -> ChannelKind;

    /// Whether the underlying socket is still open
    fn is_active(&self) -> bool;

    /// Request the socket to close
    fn close(&self);

    /// Lend out the byte stream.
    ///
    /// `None` while a previous handle is alive or once the channel closed.
    /// Closing the channel must end the stream under any outstanding handle.
    fn take_io(&self) -> Option<BoxedIo> {
        None
    }

    /// SHA-256 of the peer's DER certificate, when TLS is active
    fn peer_certificate_fingerprint(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Raw engine event for one connect or bind attempt
#[derive(Debug)]
pub enum ChannelEvent {
    /// Socket established (client) or listener ready (server)
    Established(Arc<dyn Channel>),
    /// A listener accepted a child connection
    ChildEstablished(Arc<dyn Channel>),
    /// The engine reported an error
    Error(Error),
    /// The channel closed
    Closed,
}

/// Producer half of an [`EventStream`]
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl EventSink {
    /// Send an event; false once the consumer is gone
    pub fn send(&self, event: ChannelEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Report the channel as established
    pub fn established(&self, channel: Arc<dyn Channel>) -> bool {
        self.send(ChannelEvent::Established(channel))
    }

    /// Report an accepted child
    pub fn child(&self, channel: Arc<dyn Channel>) -> bool {
        self.send(ChannelEvent::ChildEstablished(channel))
    }

    /// Report an error
    pub fn error(&self, err: Error) -> bool {
        self.send(ChannelEvent::Error(err))
    }

    /// Report closure
    pub fn closed(&self) -> bool {
        self.send(ChannelEvent::Closed)
    }

    /// Whether the consumer dropped the stream
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Stream of raw engine events for one attempt
///
/// Dropping the stream aborts the engine task attached with
/// [`EventStream::with_task`]. A panic in that task is resumed on the task
/// polling the stream once the event source runs dry.
pub struct EventStream {
    inner: BoxStream<'static, ChannelEvent>,
    inner_done: bool,
    task: Option<JoinHandle<()>>,
}

impl EventStream {
    /// Wrap an arbitrary event stream
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = ChannelEvent> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
            inner_done: false,
            task: None,
        }
    }

    /// Create a sink/stream pair backed by an unbounded queue
    pub fn channel() -> (EventSink, EventStream) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        (EventSink { tx }, EventStream::new(stream))
    }

    /// A stream that reports `err` and ends
    pub fn failed(err: Error) -> Self {
        EventStream::new(futures::stream::once(async move {
            ChannelEvent::Error(err)
        }))
    }

    /// A stream for an already-open channel (e.g. taken from a pool)
    ///
    /// Reports `Established` once and then stays silent.
    pub fn established(channel: Arc<dyn Channel>) -> Self {
        EventStream::new(
            futures::stream::once(async move { ChannelEvent::Established(channel) })
                .chain(futures::stream::pending()),
        )
    }

    /// Tie the engine task driving this attempt to the stream's lifetime
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("inner_done", &self.inner_done)
            .field("task", &self.task.is_some())
            .finish()
    }
}

impl Stream for EventStream {
    type Item = ChannelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChannelEvent>> {
        let this = &mut *self;

        if !this.inner_done {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(event)) => return Poll::Ready(Some(event)),
                Poll::Ready(None) => this.inner_done = true,
                Poll::Pending => return Poll::Pending,
            }
        }

        // Source exhausted: surface an engine panic instead of a silent end
        let Some(task) = this.task.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(task).poll(cx) {
            Poll::Ready(Err(err)) if err.is_panic() => {
                this.task = None;
                std::panic::resume_unwind(err.into_panic())
            }
            Poll::Ready(_) => {
                this.task = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The engine: opens sockets described by a template
///
/// Both methods are called from within the template's I/O runtime, so
/// implementations may use `tokio::spawn`.
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Start connecting to the template's remote address
    fn connect(&self, template: &ConnectionTemplate) -> EventStream;

    /// Start listening on the template's address
    fn bind(&self, template: &ConnectionTemplate) -> EventStream {
        let _ = template;
        EventStream::failed(Error::Unsupported("bind"))
    }
}
