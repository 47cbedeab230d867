use std::{error::Error as StdError, fmt, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{HeaderMap, Uri},
    response::Response,
    routing::get,
};
use futures_util::SinkExt;
use tokio::{net::TcpListener, time};
use tower_http::trace::TraceLayer;

use crate::vncproxy::{
    frame::FrameStream,
    net,
    peer::{Direction, Peer, PeerError, RelayReport},
    registry::{self, SessionInfo, SharedSessions},
    resolver::{ResolveError, ResolveRequest, SharedResolver},
    telemetry,
    ws::WsFrames,
};

/// Lifecycle of one inbound connection, used in log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Upgraded,
    Resolving,
    Dialing,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Upgraded => "upgraded",
            TunnelState::Resolving => "resolving",
            TunnelState::Dialing => "dialing",
            TunnelState::Active => "active",
            TunnelState::Closing => "closing",
            TunnelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum TunnelOutcome {
    /// No backend address; the framed connection was closed, nothing registered.
    ResolveFailed(ResolveError),
    /// Session construction failed; the framed connection was closed, nothing registered.
    ConnectFailed(PeerError),
    /// The session ran, was deregistered and both connections are closed.
    Finished { sid: String, report: RelayReport },
}

pub struct ProxyOptions {
    pub dial_timeout: Duration,
    pub buffer_size: usize,
    pub resolver: SharedResolver,
    pub sessions: SharedSessions,
}

/// Turns upgraded framed connections into registered tunnel sessions.
pub struct Proxy {
    opts: ProxyOptions,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("dial_timeout", &self.opts.dial_timeout)
            .field("buffer_size", &self.opts.buffer_size)
            .field("sessions", &self.opts.sessions)
            .finish_non_exhaustive()
    }
}

impl Proxy {
    pub fn new(opts: ProxyOptions) -> Self {
        Self { opts }
    }

    pub fn sessions(&self) -> &SharedSessions {
        &self.opts.sessions
    }

    /// Drives one connection from upgrade to close.
    pub async fn serve<F>(&self, source: F, req: ResolveRequest) -> TunnelOutcome
    where
        F: FrameStream + Send + Unpin + 'static,
    {
        let mut source = source;
        let client = req.client.map(|a| a.to_string()).unwrap_or_default();
        tracing::debug!(client = %client, uri = %req.uri, state = %TunnelState::Upgraded, "tunnel: connection upgraded");
        tracing::trace!(client = %client, state = %TunnelState::Resolving, "tunnel: resolving backend");

        let target = match self.opts.resolver.resolve(&req).await {
            Ok(t) => t,
            Err(err) => {
                telemetry::resolve_failed();
                close_source(&mut source).await;
                tracing::debug!(client = %client, state = %TunnelState::Closed, "tunnel: closed");
                return TunnelOutcome::ResolveFailed(err);
            }
        };

        tracing::debug!(client = %client, target = %target, state = %TunnelState::Dialing, "tunnel: backend resolved");

        let peer = match Peer::builder()
            .source(source)
            .target_addr(target.clone())
            .dial_timeout(self.opts.dial_timeout)
            .buffer_size(self.opts.buffer_size)
            .connect()
            .await
        {
            Ok(p) => p,
            Err(err) => {
                if matches!(err, PeerError::Dial(_)) {
                    telemetry::dial_failed();
                }
                tracing::debug!(client = %client, state = %TunnelState::Closed, "tunnel: closed");
                return TunnelOutcome::ConnectFailed(err);
            }
        };

        let sid = peer.id().to_string();
        self.opts.sessions.add(
            SessionInfo {
                id: sid.clone(),
                client: client.clone(),
                target: peer.target_addr().to_string(),
                started_at_unix_ms: registry::now_unix_ms(),
            },
            peer.closer(),
        );
        tracing::info!(
            sid = %sid,
            client = %client,
            target = %target,
            dial_timeout = %humantime::format_duration(peer.dial_timeout()),
            state = %TunnelState::Active,
            "tunnel: session active"
        );

        let sessions = self.opts.sessions.clone();
        let report = peer
            .run({
                let sid = sid.clone();
                move |first| {
                    tracing::debug!(sid = %sid, first = %first, state = %TunnelState::Closing, "tunnel: relay ended");
                    sessions.remove(&sid);
                }
            })
            .await;

        for (direction, outcome) in [
            (Direction::FromClient, &report.from_client),
            (Direction::FromBackend, &report.from_backend),
        ] {
            if let Some(err) = outcome.failure() {
                tracing::info!(sid = %sid, direction = %direction, err = %error_chain(err), "tunnel: relay failed");
            }
        }

        telemetry::relayed(report.from_client.bytes, report.from_backend.bytes);
        tracing::debug!(sid = %sid, state = %TunnelState::Closed, "tunnel: closed");

        TunnelOutcome::Finished { sid, report }
    }
}

pub fn router(proxy: Arc<Proxy>, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(serve_ws))
        .with_state(proxy)
        .layer(TraceLayer::new_for_http())
}

async fn serve_ws(
    State(proxy): State<Arc<Proxy>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let req = ResolveRequest {
        uri,
        headers,
        client: Some(client),
    };
    ws.on_failed_upgrade(move |err| {
        tracing::info!(client = %client, err = %err, "tunnel: upgrade to websocket failed");
    })
    .on_upgrade(move |socket| async move {
        match proxy.serve(WsFrames::new(socket), req).await {
            TunnelOutcome::ResolveFailed(err) => {
                tracing::info!(client = %client, err = %err, "tunnel: resolve backend failed");
            }
            TunnelOutcome::ConnectFailed(err) => {
                tracing::info!(client = %client, err = %error_chain(&err), "tunnel: new peer failed");
            }
            TunnelOutcome::Finished { sid, report } => {
                tracing::info!(
                    sid = %sid,
                    client = %client,
                    first = %report.first,
                    bytes_from_client = report.from_client.bytes,
                    bytes_from_backend = report.from_backend.bytes,
                    "tunnel: session closed"
                );
            }
        }
    })
}

pub async fn serve_with_shutdown(
    listen_addr: &str,
    app: Router,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind http {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "http: listening");

    axum::serve(ln, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("http: serve")?;

    Ok(())
}

async fn close_source<F>(source: &mut F)
where
    F: FrameStream + Unpin,
{
    if let Ok(Err(err)) = time::timeout(Duration::from_secs(1), source.close()).await {
        tracing::debug!(err = %err, "tunnel: close framed connection");
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(cause) = cur {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        cur = cause.source();
    }
    out
}
