//! Byte-stream view of a channel.
//!
//! [`ChannelStream`] adapts a caching [`Channel`] to tokio's [`AsyncRead`]
//! and [`AsyncWrite`], so channel data can go through `tokio::io::copy`,
//! codecs and anything else written against those traits.
//!
//! - Reads drain the channel's receive cache and re-evaluate the local
//!   window, so the peer is granted more space as the application consumes.
//! - Writes go through [`Channel::send_data`] and wait on the remote window.
//! - `shutdown` sends EOF; the channel itself stays open until closed.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use strand_platform::{StrandError, StrandResult};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::channel::Channel;

/// Bytes pulled from the channel cache per read.
const READ_CHUNK: usize = 32 * 1024;

type ReadFuture = Pin<Box<dyn Future<Output = StrandResult<Bytes>> + Send>>;
type WriteFuture = Pin<Box<dyn Future<Output = StrandResult<()>> + Send>>;

/// [`AsyncRead`] + [`AsyncWrite`] over a channel.
///
/// Reading requires a channel created with `cache_incoming`; otherwise reads
/// fail with [`io::ErrorKind::Unsupported`].
pub struct ChannelStream {
    channel: Arc<Channel>,
    read: Option<ReadFuture>,
    unread: Bytes,
    write: Option<(usize, WriteFuture)>,
}

impl ChannelStream {
    /// Wraps `channel`.
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            read: None,
            unread: Bytes::new(),
            write: None,
        }
    }

    /// The wrapped channel.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Returns the wrapped channel. Bytes already read from the cache but
    /// not yet returned are lost.
    pub fn into_inner(self) -> Arc<Channel> {
        self.channel
    }

    fn poll_write_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let Some((len, future)) = self.write.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let len = *len;
        let result = ready!(future.as_mut().poll(cx));
        self.write = None;
        Poll::Ready(result.map(|()| len).map_err(into_io))
    }
}

impl std::fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStream")
            .field("channel", &self.channel)
            .field("unread", &self.unread.len())
            .field("write_pending", &self.write.is_some())
            .finish()
    }
}

fn into_io(error: StrandError) -> io::Error {
    match error {
        StrandError::Io(e) => e,
        StrandError::IllegalState(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
        e if e.is_timeout() => io::Error::new(io::ErrorKind::TimedOut, e),
        StrandError::Channel(msg) => io::Error::new(io::ErrorKind::BrokenPipe, msg),
        e => io::Error::new(io::ErrorKind::Other, e),
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.unread.is_empty() {
            let channel = &this.channel;
            let future = this.read.get_or_insert_with(|| -> ReadFuture {
                let channel = channel.clone();
                Box::pin(async move {
                    let mut chunk = vec![0u8; READ_CHUNK];
                    let n = channel.read(&mut chunk).await?;
                    chunk.truncate(n);
                    Ok(Bytes::from(chunk))
                })
            });
            let result = ready!(future.as_mut().poll(cx));
            this.read = None;
            // An empty chunk is end of stream.
            this.unread = result.map_err(into_io)?;
        }

        let n = this.unread.len().min(buf.remaining());
        buf.put_slice(&this.unread[..n]);
        this.unread.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // A pending write finishes before new data is accepted; callers
        // retry with the same buffer per the AsyncWrite contract.
        if this.write.is_none() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let channel = this.channel.clone();
            let data = buf.to_vec();
            let len = data.len();
            let future: WriteFuture = Box::pin(async move { channel.send_data(&data).await });
            this.write = Some((len, future));
        }
        this.poll_write_pending(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        Poll::Ready(this.channel.send_eof().map_err(into_io))
    }
}
