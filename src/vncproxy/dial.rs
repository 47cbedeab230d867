use std::{io, time::Duration};

use socket2::{SockRef, TcpKeepalive};
use tokio::{net::TcpStream, time};

use crate::vncproxy::net;

/// Used whenever the configured dial timeout is zero.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP keepalive probe period applied to every backend connection.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// A backend could not be reached or its socket could not be tuned.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("cannot connect to backend {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to backend {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("enable keepalive on backend {addr} failed")]
    KeepAlive {
        addr: String,
        #[source]
        source: io::Error,
    },
}

pub fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_DIAL_TIMEOUT
    } else {
        timeout
    }
}

/// Opens a single TCP connection to `addr` with keepalive enabled.
///
/// There is no retry; the caller decides what a failure means for its session.
pub async fn dial_backend(addr: &str, timeout: Duration) -> Result<TcpStream, DialError> {
    let timeout = effective_timeout(timeout);
    let target = net::normalize_dial_addr(addr);

    let conn = match time::timeout(timeout, TcpStream::connect(target.as_ref())).await {
        Ok(Ok(c)) => c,
        Ok(Err(source)) => {
            return Err(DialError::Connect {
                addr: addr.to_string(),
                source,
            });
        }
        Err(_) => {
            return Err(DialError::Timeout {
                addr: addr.to_string(),
                timeout,
            });
        }
    };

    enable_keepalive(&conn).map_err(|source| DialError::KeepAlive {
        addr: addr.to_string(),
        source,
    })?;

    Ok(conn)
}

fn enable_keepalive(conn: &TcpStream) -> io::Result<()> {
    let ka = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let ka = ka.with_interval(KEEPALIVE_PERIOD);
    SockRef::from(conn).set_tcp_keepalive(&ka)
}
