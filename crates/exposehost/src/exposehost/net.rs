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

/// Splits `host:port` (or `[v6]:port`) into its parts. Brackets are stripped from the host.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let addr = addr.trim();
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// Returns `addr` with its port replaced, keeping the host exactly as written.
pub fn with_port(addr: &str, port: u16) -> Option<String> {
    let (host, _) = split_host_port(addr)?;
    if host.contains(':') {
        Some(format!("[{host}]:{port}"))
    } else {
        Some(format!("{host}:{port}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn split_host_port_forms() {
        assert_eq!(split_host_port("exposehost.me:1435"), Some(("exposehost.me", 1435)));
        assert_eq!(split_host_port("[::1]:80"), Some(("::1", 80)));
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("nohost"), None);
        assert_eq!(split_host_port("host:notaport"), None);
    }

    #[test]
    fn with_port_keeps_host() {
        assert_eq!(with_port("127.0.0.1:1435", 1437).as_deref(), Some("127.0.0.1:1437"));
        assert_eq!(with_port("[::1]:1435", 1436).as_deref(), Some("[::1]:1436"));
        assert_eq!(with_port("bad", 1), None);
    }
}
