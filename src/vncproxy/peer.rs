use std::{fmt, io, sync::Arc, time::Duration};

use futures_util::SinkExt;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
    time,
};

use crate::vncproxy::{
    dial::{self, DialError},
    frame::{FrameStream, FramedStream},
    registry,
};

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound for sending a close frame to a client that may already be gone.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("invalid session configuration: {0}")]
    Config(&'static str),
    #[error(transparent)]
    Dial(#[from] DialError),
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The session's close signal fired while this relay was blocked.
    #[error("connection closed by session teardown")]
    Closed,
    #[error("read failed")]
    Read(#[source] io::Error),
    #[error("write failed")]
    Write(#[source] io::Error),
    #[error("relay task failed")]
    Join(#[from] tokio::task::JoinError),
}

impl RelayError {
    /// True for errors that are an expected part of tearing a session down.
    pub fn is_benign(&self) -> bool {
        matches!(self, RelayError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Framed connection to backend.
    FromClient,
    /// Backend to framed connection.
    FromBackend,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::FromClient => write!(f, "client->backend"),
            Direction::FromBackend => write!(f, "backend->client"),
        }
    }
}

/// Single-fire close signal shared by everything that may end a session.
///
/// Only the first `close()` returns true; every relay waiting in `closed()`
/// wakes up.
#[derive(Debug, Clone)]
pub struct Closer {
    tx: Arc<watch::Sender<bool>>,
}

impl Closer {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub bytes: u64,
    pub error: Option<RelayError>,
}

impl RelayOutcome {
    /// The error worth reporting, if any. [`RelayError::Closed`] never is.
    pub fn failure(&self) -> Option<&RelayError> {
        self.error.as_ref().filter(|e| !e.is_benign())
    }
}

#[derive(Debug)]
pub struct RelayReport {
    /// The direction whose termination started teardown.
    pub first: Direction,
    pub from_client: RelayOutcome,
    pub from_backend: RelayOutcome,
}

pub struct PeerBuilder<F> {
    source: Option<F>,
    target_addr: String,
    dial_timeout: Duration,
    buffer_size: usize,
}

impl<F> PeerBuilder<F>
where
    F: FrameStream + Send + Unpin + 'static,
{
    pub fn source(mut self, source: F) -> Self {
        self.source = Some(source);
        self
    }

    pub fn target_addr(mut self, addr: impl Into<String>) -> Self {
        self.target_addr = addr.into();
        self
    }

    /// Zero means [`dial::DEFAULT_DIAL_TIMEOUT`].
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Zero means [`DEFAULT_BUFFER_SIZE`].
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Validates the inputs, then dials the backend.
    ///
    /// On failure no session exists and the framed connection (if one was
    /// given) has been closed.
    pub async fn connect(self) -> Result<Peer<F>, PeerError> {
        let Some(mut source) = self.source else {
            return Err(PeerError::Config("framed connection is missing"));
        };

        let target_addr = self.target_addr.trim().to_string();
        if target_addr.is_empty() {
            close_frames(&mut source).await;
            return Err(PeerError::Config("backend address is empty"));
        }

        let dial_timeout = dial::effective_timeout(self.dial_timeout);
        let target = match dial::dial_backend(&target_addr, dial_timeout).await {
            Ok(c) => c,
            Err(err) => {
                close_frames(&mut source).await;
                return Err(err.into());
            }
        };

        Ok(Peer {
            id: registry::new_session_id(),
            target_addr,
            dial_timeout,
            buffer_size: if self.buffer_size == 0 {
                DEFAULT_BUFFER_SIZE
            } else {
                self.buffer_size
            },
            source,
            target,
            closer: Closer::new(),
        })
    }
}

/// One framed client connection paired with one backend TCP connection.
pub struct Peer<F> {
    id: String,
    target_addr: String,
    dial_timeout: Duration,
    buffer_size: usize,
    source: F,
    target: TcpStream,
    closer: Closer,
}

impl<F> fmt::Debug for Peer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("target_addr", &self.target_addr)
            .finish_non_exhaustive()
    }
}

impl<F> Peer<F>
where
    F: FrameStream + Send + Unpin + 'static,
{
    pub fn builder() -> PeerBuilder<F> {
        PeerBuilder {
            source: None,
            target_addr: String::new(),
            dial_timeout: Duration::ZERO,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_addr(&self) -> &str {
        &self.target_addr
    }

    /// The timeout the backend dial actually used.
    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn closer(&self) -> Closer {
        self.closer.clone()
    }

    /// Relays bytes in both directions until one direction ends or the close
    /// signal fires, then closes both connections.
    ///
    /// Backend-to-client runs on its own task, client-to-backend runs inline.
    /// `on_first_exit` is called once, as soon as the first direction ends and
    /// before the other one is told to stop.
    pub async fn run<H>(self, on_first_exit: H) -> RelayReport
    where
        H: FnOnce(Direction) + Send,
    {
        let Peer {
            id,
            source,
            target,
            closer,
            buffer_size,
            ..
        } = self;

        let (mut target_rd, mut target_wr) = target.into_split();
        let (mut source_rd, source_wr) = tokio::io::split(FramedStream::new(source));

        let mut backend = tokio::spawn({
            let closer = closer.clone();
            async move {
                let mut source_wr = source_wr;
                let outcome = relay(&mut target_rd, &mut source_wr, &closer, buffer_size).await;
                (outcome, source_wr)
            }
        });

        let (first, from_client, joined) = {
            let inline = relay(&mut source_rd, &mut target_wr, &closer, buffer_size);
            tokio::pin!(inline);

            tokio::select! {
                outcome = &mut inline => {
                    on_first_exit(Direction::FromClient);
                    closer.close();
                    (Direction::FromClient, outcome, (&mut backend).await)
                }
                joined = &mut backend => {
                    on_first_exit(Direction::FromBackend);
                    closer.close();
                    (Direction::FromBackend, inline.await, joined)
                }
            }
        };

        tracing::debug!(sid = %id, first = %first, "peer: relays stopped, closing connections");

        if let Err(err) = target_wr.shutdown().await {
            tracing::debug!(sid = %id, err = %err, "peer: backend shutdown");
        }
        drop(target_wr);

        let from_backend = match joined {
            Ok((outcome, mut source_wr)) => {
                match time::timeout(CLOSE_TIMEOUT, source_wr.shutdown()).await {
                    Ok(Err(err)) => tracing::debug!(sid = %id, err = %err, "peer: client close"),
                    Err(_) => tracing::debug!(sid = %id, "peer: client close timed out"),
                    Ok(Ok(())) => {}
                }
                outcome
            }
            Err(err) => RelayOutcome {
                bytes: 0,
                error: Some(RelayError::Join(err)),
            },
        };
        drop(source_rd);

        RelayReport {
            first,
            from_client,
            from_backend,
        }
    }
}

/// Copies `reader` into `writer` chunk by chunk until EOF, an I/O error, or
/// the close signal.
async fn relay<R, W>(
    reader: &mut R,
    writer: &mut W,
    closer: &Closer,
    buffer_size: usize,
) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut bytes = 0u64;

    let error = loop {
        let n = tokio::select! {
            biased;
            _ = closer.closed() => break Some(RelayError::Closed),
            res = reader.read(&mut buf) => match res {
                Ok(n) => n,
                Err(err) => break Some(RelayError::Read(err)),
            },
        };
        if n == 0 {
            break None;
        }

        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        tokio::select! {
            biased;
            _ = closer.closed() => break Some(RelayError::Closed),
            res = write => {
                if let Err(err) = res {
                    break Some(RelayError::Write(err));
                }
            }
        }
        bytes += n as u64;
    };

    RelayOutcome { bytes, error }
}

async fn close_frames<F>(source: &mut F)
where
    F: FrameStream + Unpin,
{
    match time::timeout(CLOSE_TIMEOUT, source.close()).await {
        Ok(Err(err)) => tracing::debug!(err = %err, "peer: close framed connection"),
        Err(_) => tracing::debug!("peer: close framed connection timed out"),
        Ok(Ok(())) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vncproxy::testutil::{ChannelFrames, frame_pair};
    use futures::StreamExt;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn closer_fires_once() {
        let c = Closer::new();
        assert!(!c.is_closed());
        assert!(c.close());
        assert!(!c.clone().close());
        assert!(c.is_closed());
    }

    #[tokio::test]
    async fn missing_source_is_config_error() {
        let err = Peer::<ChannelFrames>::builder()
            .target_addr("127.0.0.1:5901")
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Config(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn empty_address_is_config_error_and_closes_source() {
        let (frames, remote) = frame_pair();
        let err = Peer::builder()
            .source(frames)
            .target_addr("   ")
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Config(_)), "got {err:?}");
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn dial_failure_closes_source() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);

        let (frames, remote) = frame_pair();
        let err = Peer::builder()
            .source(frames)
            .target_addr(addr.to_string())
            .dial_timeout(Duration::from_secs(2))
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Dial(_)), "got {err:?}");
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn zero_dial_timeout_uses_default() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (frames, _remote) = frame_pair();
        let peer = Peer::builder()
            .source(frames)
            .target_addr(ln.local_addr().unwrap().to_string())
            .dial_timeout(Duration::ZERO)
            .connect()
            .await
            .expect("connect");
        assert_eq!(peer.dial_timeout(), dial::DEFAULT_DIAL_TIMEOUT);
        assert!(peer.id().starts_with('s'));
    }

    #[tokio::test]
    async fn relays_bytes_in_order_both_ways() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (frames, mut remote) = frame_pair();
        let peer = Peer::builder()
            .source(frames)
            .target_addr(ln.local_addr().unwrap().to_string())
            .buffer_size(7)
            .connect()
            .await
            .expect("connect");
        let (mut backend, _) = ln.accept().await.unwrap();
        let run = tokio::spawn(peer.run(|_| {}));

        let mut expected = Vec::new();
        for i in 0..50u8 {
            let chunk = vec![i; (i as usize * 37) % 300 + 1];
            remote.send(&chunk);
            expected.extend(chunk);
        }
        let mut got = vec![0u8; expected.len()];
        time::timeout(WAIT, backend.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, expected);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        backend.write_all(&payload).await.unwrap();
        let mut received = Vec::new();
        while received.len() < payload.len() {
            let frame = time::timeout(WAIT, remote.outbound.next())
                .await
                .unwrap()
                .expect("frame");
            assert!(frame.len() <= 7);
            received.extend_from_slice(&frame);
        }
        assert_eq!(received, payload);

        remote.hang_up();
        let report = time::timeout(WAIT, run).await.unwrap().unwrap();
        assert_eq!(report.first, Direction::FromClient);
        assert!(report.from_client.error.is_none());
        assert_eq!(report.from_client.bytes, expected.len() as u64);
        assert_eq!(report.from_backend.bytes, payload.len() as u64);
        assert!(report.from_backend.error.as_ref().is_some_and(|e| e.is_benign()));
        assert!(report.from_backend.failure().is_none());

        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn backend_drop_tears_down_client_side() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (frames, remote) = frame_pair();
        let peer = Peer::builder()
            .source(frames)
            .target_addr(ln.local_addr().unwrap().to_string())
            .connect()
            .await
            .expect("connect");
        let (backend, _) = ln.accept().await.unwrap();

        let first_exit = Arc::new(std::sync::Mutex::new(None));
        let run = tokio::spawn(peer.run({
            let first_exit = first_exit.clone();
            move |d| *first_exit.lock().unwrap() = Some(d)
        }));

        drop(backend);

        let report = time::timeout(WAIT, run).await.unwrap().unwrap();
        assert_eq!(report.first, Direction::FromBackend);
        assert_eq!(*first_exit.lock().unwrap(), Some(Direction::FromBackend));
        assert!(report.from_client.error.as_ref().is_some_and(|e| e.is_benign()));
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn client_transport_error_is_a_real_failure() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (frames, remote) = frame_pair();
        let peer = Peer::builder()
            .source(frames)
            .target_addr(ln.local_addr().unwrap().to_string())
            .connect()
            .await
            .expect("connect");
        let (mut backend, _) = ln.accept().await.unwrap();
        let run = tokio::spawn(peer.run(|_| {}));

        remote.fail(io::ErrorKind::ConnectionReset);

        let report = time::timeout(WAIT, run).await.unwrap().unwrap();
        assert_eq!(report.first, Direction::FromClient);
        match report.from_client.failure() {
            Some(RelayError::Read(err)) => assert_eq!(err.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected a read failure, got {other:?}"),
        }
        assert!(report.from_backend.error.as_ref().is_some_and(|e| e.is_benign()));
        assert!(remote.is_closed());

        let mut rest = Vec::new();
        time::timeout(WAIT, backend.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn backend_reset_is_a_real_failure() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (frames, remote) = frame_pair();
        let peer = Peer::builder()
            .source(frames)
            .target_addr(ln.local_addr().unwrap().to_string())
            .connect()
            .await
            .expect("connect");
        let (backend, _) = ln.accept().await.unwrap();
        let run = tokio::spawn(peer.run(|_| {}));

        // Zero linger turns the close into an RST.
        socket2::SockRef::from(&backend)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(backend);

        let report = time::timeout(WAIT, run).await.unwrap().unwrap();
        assert_eq!(report.first, Direction::FromBackend);
        assert!(
            matches!(report.from_backend.failure(), Some(RelayError::Read(_))),
            "got {:?}",
            report.from_backend.error
        );
        assert!(report.from_client.error.as_ref().is_some_and(|e| e.is_benign()));
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn external_close_unblocks_both_relays() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (frames, remote) = frame_pair();
        let peer = Peer::builder()
            .source(frames)
            .target_addr(ln.local_addr().unwrap().to_string())
            .connect()
            .await
            .expect("connect");
        let (mut backend, _) = ln.accept().await.unwrap();

        let closer = peer.closer();
        let run = tokio::spawn(peer.run(|_| {}));

        tokio::task::yield_now().await;
        assert!(closer.close());

        let report = time::timeout(WAIT, run).await.unwrap().unwrap();
        assert!(report.from_client.failure().is_none());
        assert!(report.from_backend.failure().is_none());
        assert!(remote.is_closed());

        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
