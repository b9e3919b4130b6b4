//! Scripted engine shared by the integration tests
#![allow(dead_code)]

use futures::future::BoxFuture;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wire_connect::connection::{
    Channel, ChannelId, ChannelKind, ChannelPool, ConnectionTemplate, EventSink, EventStream,
    Transport,
};

/// In-memory channel that counts close requests
#[derive(Debug)]
pub struct MockChannel {
    id: ChannelId,
    kind: ChannelKind,
    active: AtomicBool,
    closes: AtomicUsize,
}

impl MockChannel {
    pub fn socket(peer: &str) -> Arc<Self> {
        Self::with_kind(ChannelKind::Socket {
            local: "10.0.0.2:50000".parse().unwrap(),
            peer: peer.parse().unwrap(),
        })
    }

    pub fn listener(local: &str) -> Arc<Self> {
        Self::with_kind(ChannelKind::Listener {
            local: local.parse().unwrap(),
        })
    }

    pub fn with_kind(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::next(),
            kind,
            active: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Channel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
    }
}

type Script = Arc<dyn Fn(EventSink, ConnectionTemplate) -> BoxFuture<'static, ()> + Send + Sync>;

/// Engine that runs a script against the event sink of every attempt
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Script,
    connects: Arc<AtomicUsize>,
    binds: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new<F, Fut>(script: F) -> Arc<Self>
    where
        F: Fn(EventSink, ConnectionTemplate) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Arc::new(Self {
            script: Arc::new(
                move |sink: EventSink, template: ConnectionTemplate| -> BoxFuture<'static, ()> {
                    Box::pin(script(sink, template))
                },
            ),
            connects: Arc::new(AtomicUsize::new(0)),
            binds: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Establish `channel` and keep the stream open
    pub fn establishing(channel: Arc<MockChannel>) -> Arc<Self> {
        Self::new(move |sink, _| {
            let channel = channel.clone();
            async move {
                sink.established(channel);
                futures::future::pending::<()>().await;
            }
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    fn start(&self, template: &ConnectionTemplate) -> EventStream {
        let (sink, events) = EventStream::channel();
        let task = tokio::spawn((self.script)(sink, template.clone()));
        events.with_task(task)
    }
}

impl fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("connects", &self.connects())
            .field("binds", &self.binds())
            .finish()
    }
}

impl Transport for ScriptedTransport {
    fn connect(&self, template: &ConnectionTemplate) -> EventStream {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.start(template)
    }

    fn bind(&self, template: &ConnectionTemplate) -> EventStream {
        self.binds.fetch_add(1, Ordering::SeqCst);
        self.start(template)
    }
}

/// Pool holding at most one idle channel
#[derive(Debug, Default)]
pub struct SingleSlotPool {
    idle: Mutex<Option<Arc<dyn Channel>>>,
    released: AtomicUsize,
}

impl SingleSlotPool {
    pub fn with_idle(channel: Arc<dyn Channel>) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Some(channel)),
            released: AtomicUsize::new(0),
        })
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn has_idle(&self) -> bool {
        self.idle.lock().unwrap().is_some()
    }
}

impl ChannelPool for SingleSlotPool {
    fn acquire(&self, _template: &ConnectionTemplate) -> Option<Arc<dyn Channel>> {
        self.idle.lock().unwrap().take().filter(|c| c.is_active())
    }

    fn release(&self, channel: Arc<dyn Channel>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        *self.idle.lock().unwrap() = Some(channel);
    }
}

/// Sets its flag when dropped
pub struct DropFlag(pub Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or a second passes
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
