//! Wire logging
//!
//! A [`Wiretap`] emits one tracing event per channel event (activation,
//! reads, writes, close) at a configurable level, tagged with a category.

use super::channel::ChannelId;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::Level;

/// Category used by `TcpClient::wiretap()`
pub const CLIENT_CATEGORY: &str = "wire_connect::tcp_client";

/// Category used by `TcpServer::wiretap()`
pub const SERVER_CATEGORY: &str = "wire_connect::tcp_server";

const PREVIEW_BYTES: usize = 32;

/// Wire logger configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wiretap {
    category: Arc<str>,
    level: Level,
}

impl Wiretap {
    /// Log under `category` at `level`.
    ///
    /// # Panics
    ///
    /// Panics if `category` is empty.
    pub fn new(category: impl Into<String>, level: Level) -> Self {
        let category = category.into();
        assert!(!category.is_empty(), "wiretap category must not be empty");
        Self {
            category: category.into(),
            level,
        }
    }

    /// Category
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Level
    pub fn level(&self) -> Level {
        self.level
    }

    /// Emit one wire event
    pub fn event(&self, channel: ChannelId, event: &str, detail: fmt::Arguments<'_>) {
        let category = &*self.category;
        match self.level {
            Level::ERROR => tracing::error!(category, %channel, event, "{}", detail),
            Level::WARN => tracing::warn!(category, %channel, event, "{}", detail),
            Level::INFO => tracing::info!(category, %channel, event, "{}", detail),
            Level::DEBUG => tracing::debug!(category, %channel, event, "{}", detail),
            Level::TRACE => tracing::trace!(category, %channel, event, "{}", detail),
        }
    }

    /// Wrap a byte stream so its traffic is logged
    pub fn wrap<S>(&self, channel: ChannelId, io: S) -> WiretapIo<S> {
        WiretapIo {
            inner: io,
            tap: self.clone(),
            channel,
        }
    }
}

/// Byte stream logging every read, write, flush and shutdown
#[derive(Debug)]
pub struct WiretapIo<S> {
    inner: S,
    tap: Wiretap,
    channel: ChannelId,
}

impl<S> WiretapIo<S> {
    /// Unwrap the inner stream
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for WiretapIo<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let read = &buf.filled()[before..];
        if read.is_empty() {
            this.tap.event(this.channel, "EOF", format_args!("end of stream"));
        } else {
            this.tap.event(
                this.channel,
                "READ",
                format_args!("{}B {}", read.len(), preview(read)),
            );
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WiretapIo<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.tap.event(
            this.channel,
            "WRITE",
            format_args!("{}B {}", written, preview(&buf[..written])),
        );
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        this.tap.event(this.channel, "FLUSH", format_args!(""));
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_shutdown(cx))?;
        this.tap.event(this.channel, "SHUTDOWN", format_args!(""));
        Poll::Ready(Ok(()))
    }
}

/// Hex of the first bytes, `..` when truncated
fn preview(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(PREVIEW_BYTES * 2 + 2);
    for b in bytes.iter().take(PREVIEW_BYTES) {
        out.push_str(&format!("{:02x}", b));
    }
    if bytes.len() > PREVIEW_BYTES {
        out.push_str("..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview(b"\x01\xff"), "01ff");
        let long = vec![0u8; PREVIEW_BYTES + 1];
        assert!(preview(&long).ends_with(".."));
    }

    #[test]
    #[should_panic(expected = "wiretap category must not be empty")]
    fn test_empty_category_panics() {
        let _ = Wiretap::new("", Level::DEBUG);
    }

    #[tokio::test]
    async fn test_wrapped_stream_passes_bytes_through() {
        let (a, b) = tokio::io::duplex(64);
        let tap = Wiretap::new("test", Level::TRACE);
        let mut a = tap.wrap(ChannelId::next(), a);
        let mut b = tap.wrap(ChannelId::next(), b);

        a.write_all(b"ping").await.unwrap();
        a.flush().await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        a.shutdown().await.unwrap();
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }
}
