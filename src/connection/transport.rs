//! Default engine: TCP over tokio with an optional rustls handshake

use super::channel::{BoxedIo, Channel, ChannelId, ChannelKind, EventSink, EventStream, Transport};
use super::resolver::AddressResolver;
use super::resources::ChannelImpl;
use super::template::{ConnectionTemplate, RemoteAddress, SocketOptions};
use super::tls::SslStage;
use super::wiretap::Wiretap;
use crate::{Error, Result};
use sha2::Digest;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tracing::Instrument;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);
const DEFAULT_BACKLOG: u32 = 1024;

/// TCP stream variant: plain or TLS-encrypted
pub enum TcpVariant {
    /// Plain TCP connection
    Plain(TcpStream),
    /// TLS-encrypted TCP connection
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for TcpVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TcpVariant::Plain(_) => f.write_str("TcpVariant::Plain(TcpStream)"),
            TcpVariant::Tls(_) => f.write_str("TcpVariant::Tls(TlsStream)"),
        }
    }
}

impl TcpVariant {
    /// SHA-256 of the server's DER-encoded certificate.
    ///
    /// Returns `None` for plain TCP connections.
    pub fn peer_certificate_fingerprint(&self) -> Option<Vec<u8>> {
        match self {
            TcpVariant::Plain(_) => None,
            TcpVariant::Tls(stream) => {
                let (_tcp, conn) = stream.get_ref();
                let certs = conn.peer_certificates()?;
                let server_cert = certs.first()?;
                let hash = sha2::Sha256::digest(server_cert.as_ref());
                Some(hash.to_vec())
            }
        }
    }
}

impl AsyncRead for TcpVariant {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpVariant::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            TcpVariant::Tls(stream) => Pin::new(&mut **stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpVariant {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TcpVariant::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            TcpVariant::Tls(stream) => Pin::new(&mut **stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpVariant::Plain(stream) => Pin::new(stream).poll_flush(cx),
            TcpVariant::Tls(stream) => Pin::new(&mut **stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpVariant::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            TcpVariant::Tls(stream) => Pin::new(&mut **stream).poll_shutdown(cx),
        }
    }
}

/// Socket slot shared by a channel and the stream handed out by `take_io`
#[derive(Debug, Default)]
struct IoSlot {
    io: Option<TcpVariant>,
    taken: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

type SharedSlot = Arc<Mutex<IoSlot>>;

fn lock_slot(slot: &Mutex<IoSlot>) -> MutexGuard<'_, IoSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove the socket and wake whoever is parked on it
fn detach_slot(slot: &Mutex<IoSlot>) -> Option<TcpVariant> {
    let (io, wakers) = {
        let mut slot = lock_slot(slot);
        let wakers = [slot.read_waker.take(), slot.write_waker.take()];
        (slot.io.take(), wakers)
    };
    for waker in wakers.into_iter().flatten() {
        waker.wake();
    }
    io
}

/// Shut the socket down on the current runtime, or just drop it
fn shutdown_detached(channel: ChannelId, mut io: TcpVariant) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(err) = io.shutdown().await {
                    tracing::debug!(%channel, error = %err, "shutdown failed");
                }
            });
        }
        Err(_) => drop(io),
    }
}

/// Byte stream of a [`TokioChannel`]
///
/// The socket stays owned by the channel: closing the channel shuts it down
/// under this handle, after which reads report EOF and writes fail with
/// `NotConnected`. Dropping the handle gives the stream back to the channel.
#[derive(Debug)]
pub struct ChannelIo {
    slot: SharedSlot,
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel closed")
}

impl AsyncRead for ChannelIo {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut guard = lock_slot(&self.slot);
        let slot = &mut *guard;
        let Some(io) = slot.io.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let poll = Pin::new(io).poll_read(cx, buf);
        if poll.is_pending() {
            slot.read_waker = Some(cx.waker().clone());
        }
        poll
    }
}

impl AsyncWrite for ChannelIo {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut guard = lock_slot(&self.slot);
        let slot = &mut *guard;
        let Some(io) = slot.io.as_mut() else {
            return Poll::Ready(Err(not_connected()));
        };
        let poll = Pin::new(io).poll_write(cx, buf);
        if poll.is_pending() {
            slot.write_waker = Some(cx.waker().clone());
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = lock_slot(&self.slot);
        let slot = &mut *guard;
        let Some(io) = slot.io.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let poll = Pin::new(io).poll_flush(cx);
        if poll.is_pending() {
            slot.write_waker = Some(cx.waker().clone());
        }
        poll
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = lock_slot(&self.slot);
        let slot = &mut *guard;
        let Some(io) = slot.io.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let poll = Pin::new(io).poll_shutdown(cx);
        if poll.is_pending() {
            slot.write_waker = Some(cx.waker().clone());
        }
        poll
    }
}

impl Drop for ChannelIo {
    fn drop(&mut self) {
        let mut slot = lock_slot(&self.slot);
        slot.taken = false;
        slot.read_waker = None;
        slot.write_waker = None;
    }
}

/// Channel backed by a tokio socket
///
/// [`Channel::take_io`] lends the byte stream out as a [`ChannelIo`]; the
/// socket itself is only closed by [`Channel::close`] (or when the channel
/// is dropped).
#[derive(Debug)]
pub struct TokioChannel {
    id: ChannelId,
    kind: ChannelKind,
    active: AtomicBool,
    close_signal: Notify,
    slot: SharedSlot,
    wiretap: Option<Wiretap>,
}

impl TokioChannel {
    fn stream(io: TcpVariant, local: SocketAddr, peer: SocketAddr, wiretap: Option<Wiretap>) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::next(),
            kind: ChannelKind::Socket { local, peer },
            active: AtomicBool::new(true),
            close_signal: Notify::new(),
            slot: Arc::new(Mutex::new(IoSlot {
                io: Some(io),
                ..IoSlot::default()
            })),
            wiretap,
        })
    }

    fn listener(local: SocketAddr, wiretap: Option<Wiretap>) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::next(),
            kind: ChannelKind::Listener { local },
            active: AtomicBool::new(true),
            close_signal: Notify::new(),
            slot: SharedSlot::default(),
            wiretap,
        })
    }

    async fn close_requested(&self) {
        loop {
            let notified = self.close_signal.notified();
            if !self.is_active() {
                return;
            }
            notified.await;
        }
    }

    fn tap(&self, event: &str, detail: std::fmt::Arguments<'_>) {
        if let Some(tap) = &self.wiretap {
            tap.event(self.id, event, detail);
        }
    }
}

impl Channel for TokioChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.tap("CLOSE", format_args!("{}", self.kind.name()));
            if let Some(io) = detach_slot(&self.slot) {
                shutdown_detached(self.id, io);
            }
            self.close_signal.notify_waiters();
        }
    }

    fn take_io(&self) -> Option<BoxedIo> {
        {
            let mut slot = lock_slot(&self.slot);
            if slot.io.is_none() || slot.taken {
                return None;
            }
            slot.taken = true;
        }
        let io = ChannelIo {
            slot: self.slot.clone(),
        };
        Some(match &self.wiretap {
            Some(tap) => Box::new(tap.wrap(self.id, io)),
            None => Box::new(io),
        })
    }

    fn peer_certificate_fingerprint(&self) -> Option<Vec<u8>> {
        lock_slot(&self.slot).io.as_ref()?.peer_certificate_fingerprint()
    }
}

/// Engine built on tokio sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTransport;

impl Transport for TokioTransport {
    fn connect(&self, template: &ConnectionTemplate) -> EventStream {
        let plan = ConnectPlan::new(template);
        let (sink, events) = EventStream::channel();
        let span = tracing::debug_span!("tcp_connect", target = %plan.target);
        events.with_task(tokio::spawn(plan.run(sink).instrument(span)))
    }

    fn bind(&self, template: &ConnectionTemplate) -> EventStream {
        let plan = BindPlan::new(template);
        let (sink, events) = EventStream::channel();
        let span = tracing::debug_span!("tcp_bind", listen = %plan.listen);
        events.with_task(tokio::spawn(plan.run(sink).instrument(span)))
    }
}

struct ConnectPlan {
    remote: RemoteAddress,
    target: RemoteAddress,
    local: Option<SocketAddr>,
    options: SocketOptions,
    tls: Option<SslStage>,
    resolver: Arc<dyn AddressResolver>,
    channel_impl: ChannelImpl,
    wiretap: Option<Wiretap>,
}

impl ConnectPlan {
    fn new(template: &ConnectionTemplate) -> Self {
        Self {
            remote: template.remote().clone(),
            target: template.connect_target(),
            local: template.local_address(),
            options: template.options().clone(),
            tls: template.tls().cloned(),
            resolver: template.resolver().clone(),
            channel_impl: template.channel_impl(),
            wiretap: template.wiretap().cloned(),
        }
    }

    async fn run(self, sink: EventSink) {
        let channel = match self.open().await {
            Ok(channel) => channel,
            Err(err) => {
                sink.error(err);
                return;
            }
        };
        if !sink.established(channel.clone()) {
            channel.close();
            return;
        }

        channel.close_requested().await;
        sink.closed();
    }

    async fn open(&self) -> Result<Arc<TokioChannel>> {
        if self.tls.is_some() && self.target != self.remote {
            return Err(Error::Unsupported("TLS through a proxy"));
        }

        let addrs = resolve(self.resolver.as_ref(), &self.target).await?;
        if self.channel_impl == ChannelImpl::Portable && has_pre_connect_options(&self.options) {
            tracing::debug!("portable channel ignores buffer, keepalive, linger and reuse options");
        }

        // One deadline covers every resolved address
        let deadline = self
            .options
            .connect_timeout()
            .map(|timeout| (tokio::time::Instant::now() + timeout, timeout));
        let mut last_err = None;
        for addr in addrs {
            match self.connect_one(addr, deadline).await {
                Ok(stream) => return self.establish(stream).await,
                Err(err) => {
                    tracing::debug!(%addr, error = %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Config(format!("no addresses for {}", self.target))))
    }

    async fn connect_one(
        &self,
        addr: SocketAddr,
        deadline: Option<(tokio::time::Instant, Duration)>,
    ) -> Result<TcpStream> {
        let connect = async {
            match (self.channel_impl, self.local) {
                (ChannelImpl::Portable, None) => TcpStream::connect(addr).await,
                (channel_impl, local) => {
                    let socket = new_socket(addr)?;
                    if channel_impl == ChannelImpl::Native {
                        apply_socket_options(&socket, &self.options)?;
                    }
                    if let Some(local) = local {
                        socket.bind(local)?;
                    }
                    socket.connect(addr).await
                }
            }
        };

        let connected = match deadline {
            Some((deadline, timeout)) => tokio::time::timeout_at(deadline, connect)
                .await
                .map_err(|_| Error::ConnectTimeout {
                    addr: addr.to_string(),
                    timeout,
                })?,
            None => connect.await,
        };
        connected.map_err(|e| Error::connect(addr, e))
    }

    async fn establish(&self, stream: TcpStream) -> Result<Arc<TokioChannel>> {
        apply_stream_options(&stream, &self.options)?;
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;

        let io = match &self.tls {
            Some(stage) => {
                let tls = stage.handshake(stream, &self.remote.host()).await?;
                tracing::debug!(%peer, "TLS connection established");
                TcpVariant::Tls(Box::new(tls))
            }
            None => TcpVariant::Plain(stream),
        };

        let channel = TokioChannel::stream(io, local, peer, self.wiretap.clone());
        channel.tap("ACTIVE", format_args!("{} => {}", local, peer));
        Ok(channel)
    }
}

struct BindPlan {
    listen: RemoteAddress,
    options: SocketOptions,
    resolver: Arc<dyn AddressResolver>,
    wiretap: Option<Wiretap>,
}

impl BindPlan {
    fn new(template: &ConnectionTemplate) -> Self {
        Self {
            listen: template.remote().clone(),
            options: template.options().clone(),
            resolver: template.resolver().clone(),
            wiretap: template.wiretap().cloned(),
        }
    }

    async fn run(self, sink: EventSink) {
        let listener = match self.listen().await {
            Ok(listener) => listener,
            Err(err) => {
                sink.error(err);
                return;
            }
        };
        let local = match listener.local_addr() {
            Ok(local) => local,
            Err(err) => {
                sink.error(Error::Io(err));
                return;
            }
        };

        let channel = TokioChannel::listener(local, self.wiretap.clone());
        channel.tap("BIND", format_args!("{}", local));
        if !sink.established(channel.clone()) {
            return;
        }

        loop {
            tokio::select! {
                _ = channel.close_requested() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(err) = apply_stream_options(&stream, &self.options) {
                            tracing::debug!(%peer, error = %err, "failed to apply socket options");
                        }
                        let child_local = stream.local_addr().unwrap_or(local);
                        let child = TokioChannel::stream(
                            TcpVariant::Plain(stream),
                            child_local,
                            peer,
                            self.wiretap.clone(),
                        );
                        child.tap("ACCEPT", format_args!("{} <= {}", child_local, peer));
                        if !sink.child(child) {
                            break;
                        }
                    }
                    Err(err) => {
                        if !sink.error(Error::classify_io(err)) {
                            break;
                        }
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        channel.tap("UNBIND", format_args!("{}", local));
        sink.closed();
    }

    async fn listen(&self) -> Result<TcpListener> {
        let addr = resolve(self.resolver.as_ref(), &self.listen)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Config(format!("no addresses for {}", self.listen)))?;

        let socket = new_socket(addr).map_err(|e| Error::connect(addr, e))?;
        apply_socket_options(&socket, &self.options).map_err(Error::classify_io)?;
        socket.bind(addr).map_err(|e| Error::connect(addr, e))?;
        socket
            .listen(self.options.backlog().unwrap_or(DEFAULT_BACKLOG))
            .map_err(|e| Error::connect(addr, e))
    }
}

async fn resolve(resolver: &dyn AddressResolver, addr: &RemoteAddress) -> Result<Vec<SocketAddr>> {
    match addr {
        RemoteAddress::Socket(addr) => Ok(vec![*addr]),
        RemoteAddress::Host { host, port } => {
            let addrs = resolver
                .resolve(host, *port)
                .await
                .map_err(|source| Error::Resolve {
                    host: host.clone(),
                    source,
                })?;
            if addrs.is_empty() {
                return Err(Error::Resolve {
                    host: host.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
                });
            }
            Ok(addrs)
        }
    }
}

fn new_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

fn buffer_size(size: usize) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX)
}

fn has_pre_connect_options(options: &SocketOptions) -> bool {
    options.reuse_address().is_some()
        || options.recv_buffer_size().is_some()
        || options.send_buffer_size().is_some()
        || options.keepalive().is_some()
        || options.linger().is_some()
}

/// Options that must be set before connect/bind
fn apply_socket_options(socket: &TcpSocket, options: &SocketOptions) -> io::Result<()> {
    if let Some(on) = options.reuse_address() {
        socket.set_reuseaddr(on)?;
    }
    if let Some(size) = options.recv_buffer_size() {
        socket.set_recv_buffer_size(buffer_size(size))?;
    }
    if let Some(size) = options.send_buffer_size() {
        socket.set_send_buffer_size(buffer_size(size))?;
    }
    if let Some(on) = options.keepalive() {
        socket.set_keepalive(on)?;
    }
    if let Some(linger) = options.linger() {
        socket.set_linger(linger)?;
    }
    Ok(())
}

/// Options applied to an established stream
fn apply_stream_options(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    if let Some(on) = options.nodelay() {
        stream.set_nodelay(on)?;
    }
    if let Some(ttl) = options.ttl() {
        stream.set_ttl(ttl)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::channel::ChannelEvent;
    use crate::connection::template::SocketOption;
    use futures::StreamExt;
    use tokio::io::AsyncReadExt;

    fn template_for(addr: SocketAddr) -> ConnectionTemplate {
        let mut template = ConnectionTemplate::client_default().clone();
        template.set_remote(addr);
        template
    }

    #[tokio::test]
    async fn test_connect_reports_established_then_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let mut events = TokioTransport.connect(&template_for(addr));
        let channel = match events.next().await {
            Some(ChannelEvent::Established(channel)) => channel,
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(channel.kind().address().unwrap(), addr);
        assert!(channel.is_active());

        let mut server_side = accept.await.unwrap();
        channel.close();
        assert!(!channel.is_active());
        assert!(matches!(events.next().await, Some(ChannelEvent::Closed)));

        let mut buf = [0u8; 1];
        assert_eq!(server_side.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut events = TokioTransport.connect(&template_for(addr));
        match events.next().await {
            Some(ChannelEvent::Error(err)) => {
                assert_eq!(err.kind(), crate::ErrorKind::Connect, "{}", err)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_portable_with_options() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _accept = tokio::spawn(async move { listener.accept().await });

        let mut template = template_for(addr);
        template.set_channel_impl(ChannelImpl::Portable);
        template.set_option(SocketOption::TcpNoDelay(true)).unwrap();
        template.set_option(SocketOption::Ttl(32)).unwrap();

        let mut events = TokioTransport.connect(&template);
        assert!(matches!(events.next().await, Some(ChannelEvent::Established(_))));
    }

    #[tokio::test]
    async fn test_bind_accepts_children() {
        let mut template = ConnectionTemplate::server_default().clone();
        template.set_remote("127.0.0.1:0".parse::<SocketAddr>().unwrap());

        let mut events = TokioTransport.bind(&template);
        let listener = match events.next().await {
            Some(ChannelEvent::Established(channel)) => channel,
            other => panic!("unexpected event: {:?}", other),
        };
        assert!(matches!(listener.kind(), ChannelKind::Listener { .. }));
        let addr = listener.kind().address().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        match events.next().await {
            Some(ChannelEvent::ChildEstablished(child)) => {
                assert!(matches!(child.kind(), ChannelKind::Socket { .. }));
                let io = child.take_io();
                assert!(io.is_some());
                assert!(child.take_io().is_none());
                drop(io);
                assert!(child.take_io().is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        listener.close();
        assert!(matches!(events.next().await, Some(ChannelEvent::Closed)));
    }

    #[tokio::test]
    async fn test_connect_timeout_is_one_deadline_across_addresses() {
        use crate::connection::resolver::StaticResolver;

        // Non-routable addresses: each attempt hangs until the deadline
        let blackholes: Vec<SocketAddr> = vec![
            "10.255.255.1:9".parse().unwrap(),
            "10.255.255.2:9".parse().unwrap(),
            "10.255.255.3:9".parse().unwrap(),
        ];
        let mut template = ConnectionTemplate::client_default().clone();
        template.set_remote(RemoteAddress::from_host("blackhole.test", 9));
        template.set_resolver(Arc::new(StaticResolver::new().with_host("blackhole.test", blackholes)));
        template
            .set_option(SocketOption::ConnectTimeout(Duration::from_millis(200)))
            .unwrap();

        let started = std::time::Instant::now();
        let mut events = TokioTransport.connect(&template);
        assert!(matches!(events.next().await, Some(ChannelEvent::Error(_))));
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
    }

    #[test]
    fn test_pre_connect_options_detected() {
        let mut options = SocketOptions::default();
        assert!(!has_pre_connect_options(&options));
        options.set(SocketOption::TcpNoDelay(true)).unwrap();
        assert!(!has_pre_connect_options(&options));
        options.set(SocketOption::KeepAlive(true)).unwrap();
        assert!(has_pre_connect_options(&options));
    }

    #[test]
    fn test_buffer_size_saturates() {
        assert_eq!(buffer_size(1024), 1024);
        assert_eq!(buffer_size(usize::MAX), u32::MAX);
    }
}
