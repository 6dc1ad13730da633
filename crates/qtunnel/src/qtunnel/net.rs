use std::{borrow::Cow, net::SocketAddr, time::Duration};

use anyhow::Context;
use tokio::{net::TcpStream, time};

/// Normalize a bind/listen address.
///
/// Flags and config files accept the shorthand `":PORT"` to mean "bind on all
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

pub async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = normalize_bind_addr(addr);
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr.as_ref())
        .await
        .with_context(|| format!("resolve {addr}"))?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("net: could not resolve {addr:?}"))
}

/// Dial a TCP upstream, bounded by `timeout` when it is non-zero.
pub async fn dial_tcp(addr: &str, timeout: Duration) -> anyhow::Result<TcpStream> {
    let addr = addr.trim();
    if addr.is_empty() {
        anyhow::bail!("net: empty upstream address");
    }
    let c = if timeout > Duration::ZERO {
        time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))?
    } else {
        TcpStream::connect(addr).await
    };
    let c = c.with_context(|| format!("dial {addr}"))?;
    let _ = c.set_nodelay(true);
    Ok(c)
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

    #[tokio::test]
    async fn resolve_literal_and_shorthand() {
        let sa = resolve_socket_addr("127.0.0.1:9").await.unwrap();
        assert_eq!(sa.port(), 9);
        let sa = resolve_socket_addr(":9999").await.unwrap();
        assert_eq!(sa.to_string(), "0.0.0.0:9999");
    }

    #[tokio::test]
    async fn dial_tcp_rejects_empty_and_refused() {
        assert!(dial_tcp("  ", Duration::from_secs(1)).await.is_err());

        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);
        assert!(dial_tcp(&addr.to_string(), Duration::from_secs(1)).await.is_err());
    }
}
