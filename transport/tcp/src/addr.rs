//! Listen/dial address parsing: `scheme://host:port` with tcp/tcp4/tcp6/ws/wss.

use nix::sys::socket::SockaddrStorage;
use rivet_rpc_core::error::{ERR_INVALID_ADDR, ERR_UNSUPPORTED_PROTOCOL, Error};
use std::net::{SocketAddr, ToSocketAddrs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tcp4,
    Tcp6,
    Ws,
    Wss,
}

impl Scheme {
    pub fn is_websocket(&self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }
}

#[derive(Debug, Clone)]
pub struct ParsedAddr {
    pub scheme: Scheme,
    /// The `host:port` part as written, for handshakes and logging.
    pub host: String,
    pub addr: SocketAddr,
}

/// Parse and resolve `scheme://host:port`. A bare `host:port` defaults
/// to tcp. tcp4/tcp6 restrict resolution to the matching family.
pub fn parse_url(url: &str) -> Result<ParsedAddr, Error> {
    let (scheme_str, rest) = match url.split_once("://") {
        Some((s, r)) => (s, r),
        None => ("tcp", url),
    };
    let scheme = match scheme_str {
        "tcp" => Scheme::Tcp,
        "tcp4" => Scheme::Tcp4,
        "tcp6" => Scheme::Tcp6,
        "ws" => Scheme::Ws,
        "wss" => Scheme::Wss,
        other => {
            return Err(Error::new(&ERR_UNSUPPORTED_PROTOCOL)
                .with_message(format!("unsupported protocol {}", other)));
        }
    };
    if rest.is_empty() {
        return Err(Error::new(&ERR_INVALID_ADDR).with_message(format!("empty address in {}", url)));
    }
    let mut addrs = rest
        .to_socket_addrs()
        .map_err(|e| Error::new(&ERR_INVALID_ADDR).with_message(format!("{}: {}", rest, e)))?;
    let addr = match scheme {
        Scheme::Tcp4 => addrs.find(SocketAddr::is_ipv4),
        Scheme::Tcp6 => addrs.find(SocketAddr::is_ipv6),
        _ => addrs.next(),
    };
    let addr = addr.ok_or_else(|| {
        Error::new(&ERR_INVALID_ADDR).with_message(format!("no usable address for {}", url))
    })?;
    Ok(ParsedAddr { scheme, host: rest.to_string(), addr })
}

/// Convert a kernel-reported sockaddr into the std form, when it is inet.
pub(crate) fn storage_to_socketaddr(st: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = st.as_sockaddr_in() {
        return Some(SocketAddr::new(sin.ip().into(), sin.port()));
    }
    if let Some(sin6) = st.as_sockaddr_in6() {
        return Some(SocketAddr::new(sin6.ip().into(), sin6.port()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schemes() {
        let p = parse_url("tcp://127.0.0.1:8000").unwrap();
        assert_eq!(p.scheme, Scheme::Tcp);
        assert_eq!(p.host, "127.0.0.1:8000");
        assert!(p.addr.is_ipv4());

        let p = parse_url("127.0.0.1:8000").unwrap();
        assert_eq!(p.scheme, Scheme::Tcp);

        let p = parse_url("tcp6://[::1]:9000").unwrap();
        assert_eq!(p.scheme, Scheme::Tcp6);
        assert!(p.addr.is_ipv6());

        let p = parse_url("ws://127.0.0.1:8000").unwrap();
        assert!(p.scheme.is_websocket());
    }

    #[test]
    fn test_parse_rejects() {
        let e = parse_url("udp://127.0.0.1:8000").unwrap_err();
        assert!(e.message().contains("unsupported protocol"));
        assert!(parse_url("tcp://").is_err());
        assert!(parse_url("tcp://no-port-here").is_err());
    }

    #[test]
    fn test_tcp4_filters_family() {
        let p = parse_url("tcp4://localhost:8000").unwrap();
        assert!(p.addr.is_ipv4());
    }
}
