use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs do not accept
/// `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Normalize a backend address before dialing.
///
/// A resolver may hand back `":PORT"` (the default resolver does), which names
/// a port on the local host. Tokio cannot connect to a host-less address, so
/// it is dialed on loopback instead.
pub fn normalize_dial_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("127.0.0.1{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_bind_addr, normalize_dial_addr};

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn normalize_dial_addr_port_only_goes_to_loopback() {
        assert_eq!(normalize_dial_addr(":5901").as_ref(), "127.0.0.1:5901");
        assert_eq!(
            normalize_dial_addr("vnc.internal:5900").as_ref(),
            "vnc.internal:5900"
        );
    }
}
