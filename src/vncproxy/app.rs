use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::vncproxy::{admin, config, logging, net, proxy, registry, resolver, telemetry};

/// Upper bound for sessions and servers to wind down after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        listen_addr = %cfg.listen_addr,
        ws_path = %cfg.ws_path,
        admin_addr = %cfg.admin_addr,
        dial_timeout = %humantime::format_duration(cfg.dial_timeout),
        buffer_size = cfg.buffer_size,
        token_targets = cfg.resolver.targets.len(),
        allowed_origins = cfg.resolver.allowed_origins.len(),
        "vncproxy: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    let tunnel = Arc::new(proxy::Proxy::new(proxy::ProxyOptions {
        dial_timeout: cfg.dial_timeout,
        buffer_size: cfg.buffer_size,
        resolver: resolver::from_config(&cfg.resolver),
        sessions: Arc::new(registry::SessionRegistry::new()),
    }));
    let sessions = tunnel.sessions().clone();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            sessions: sessions.clone(),
            config_path: resolved.path.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    {
        let listen_addr = cfg.listen_addr.clone();
        let app = proxy::router(tunnel.clone(), &cfg.ws_path);
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { proxy::serve_with_shutdown(&listen_addr, app, shutdown).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        sessions.close_all();
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let closing = sessions.close_all();
    tracing::info!(sessions = closing, "shutdown: closing sessions");

    let drain = async {
        while let Some(_res) = tasks.join_next().await {}
        while !sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(remaining = sessions.len(), "shutdown: drain timed out");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
