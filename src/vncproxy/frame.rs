//! Byte-stream view over a message-oriented connection.
//!
//! The relay works on `AsyncRead`/`AsyncWrite`. A framed connection (for
//! example a WebSocket) is anything that yields whole binary messages and
//! accepts whole binary messages; [`FramedStream`] bridges the two so the relay
//! never needs to know which transport it is talking to.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A full-duplex connection that carries discrete binary messages.
///
/// The stream side ends (`None`) when the remote closes the connection.
pub trait FrameStream: Stream<Item = io::Result<Bytes>> + Sink<Bytes, Error = io::Error> {}
impl<T> FrameStream for T where
    T: Stream<Item = io::Result<Bytes>> + Sink<Bytes, Error = io::Error> + ?Sized
{
}

pin_project! {
    /// Reads return message payloads in order. A message larger than the read
    /// buffer is kept and served by the following reads, so no byte is lost.
    /// Every write is sent as exactly one binary message.
    pub struct FramedStream<F> {
        #[pin]
        frames: F,
        pending: Bytes,
    }
}

impl<F> FramedStream<F> {
    pub fn new(frames: F) -> Self {
        Self {
            frames,
            pending: Bytes::new(),
        }
    }
}

impl<F> AsyncRead for FramedStream<F>
where
    F: Stream<Item = io::Result<Bytes>>,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            // Empty messages carry nothing; an empty read would look like EOF.
            match ready!(this.frames.as_mut().poll_next(cx)) {
                Some(Ok(frame)) => *this.pending = frame,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<F> AsyncWrite for FramedStream<F>
where
    F: Sink<Bytes, Error = io::Error>,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut this = self.project();
        ready!(this.frames.as_mut().poll_ready(cx))?;
        this.frames
            .as_mut()
            .start_send(Bytes::copy_from_slice(data))?;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().frames.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().frames.poll_close(cx)
    }
}
