use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::channel::mpsc;
use futures_util::{Sink, Stream};

/// In-memory framed connection standing in for an upgraded WebSocket.
pub struct ChannelFrames {
    inbound: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
}

/// The client side of a [`ChannelFrames`].
pub struct RemoteEnd {
    inbound: mpsc::UnboundedSender<io::Result<Bytes>>,
    pub outbound: mpsc::UnboundedReceiver<Bytes>,
    closed: Arc<AtomicBool>,
}

pub fn frame_pair() -> (ChannelFrames, RemoteEnd) {
    let (in_tx, in_rx) = mpsc::unbounded();
    let (out_tx, out_rx) = mpsc::unbounded();
    let closed = Arc::new(AtomicBool::new(false));
    (
        ChannelFrames {
            inbound: in_rx,
            outbound: out_tx,
            closed: closed.clone(),
        },
        RemoteEnd {
            inbound: in_tx,
            outbound: out_rx,
            closed,
        },
    )
}

impl RemoteEnd {
    pub fn send(&self, data: &[u8]) {
        let _ = self
            .inbound
            .unbounded_send(Ok(Bytes::copy_from_slice(data)));
    }

    pub fn fail(&self, kind: io::ErrorKind) {
        let _ = self
            .inbound
            .unbounded_send(Err(io::Error::new(kind, "test transport failure")));
    }

    /// Ends the inbound message stream, like a client closing its socket.
    pub fn hang_up(&self) {
        self.inbound.close_channel();
    }

    /// True once the proxy side closed the connection explicitly.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Stream for ChannelFrames {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inbound).poll_next(cx)
    }
}

impl Sink<Bytes> for ChannelFrames {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.outbound)
            .poll_ready(cx)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> io::Result<()> {
        Pin::new(&mut self.outbound)
            .start_send(item)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.outbound.close_channel();
        self.closed.store(true, Ordering::Release);
        Poll::Ready(Ok(()))
    }
}
