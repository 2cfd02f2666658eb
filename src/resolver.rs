//! URI → (scheme, resolved address) (§6). A pure function, as specified;
//! it owns no state and does no I/O beyond the DNS lookup `ToSocketAddrs`
//! performs.

use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::{anyhow, bail, Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
    Udp,
    Tcp,
    Shm,
}

#[derive(Debug, Clone)]
pub enum Endpoint {
    Socket(SocketAddr),
    Shm(String),
}

#[derive(Debug, Clone)]
pub struct ResolvedUri {
    pub scheme: Scheme,
    pub endpoint: Endpoint,
    /// Unresolved host, kept for server-side "bind any" (`*`) handling.
    pub host: String,
}

/// Parses `udp://host:port/`, `tcp://host:port/`, or `shm://name` into a
/// scheme plus a resolved endpoint. `host` may be an IPv4 literal, an IPv6
/// literal in brackets, a hostname, or `*` (server bind-any, left
/// unresolved here and handled by the caller).
pub fn resolve(uri: &str, is_server: bool) -> Result<ResolvedUri> {
    let (scheme_str, rest) = uri
        .split_once("://")
        .ok_or_else(|| anyhow!("uri `{uri}` is missing a scheme"))?;

    let scheme = match scheme_str {
        "udp" => Scheme::Udp,
        "tcp" => Scheme::Tcp,
        "shm" => Scheme::Shm,
        other => bail!("unknown uri scheme `{other}`"),
    };

    let rest = rest.trim_end_matches('/');

    if scheme == Scheme::Shm {
        if rest.is_empty() {
            bail!("shm uri `{uri}` is missing a segment name");
        }
        return Ok(ResolvedUri {
            scheme,
            endpoint: Endpoint::Shm(rest.to_string()),
            host: rest.to_string(),
        });
    }

    let (host, port_str) = rest
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("uri `{uri}` is missing a port"))?;
    let port: u16 = port_str
        .parse()
        .with_context(|| format!("invalid port in uri `{uri}`"))?;

    if host == "*" {
        if !is_server {
            bail!("`*` bind-any host is only valid for a server uri");
        }
        let unspecified = format!("0.0.0.0:{port}")
            .to_socket_addrs()
            .with_context(|| format!("resolving `{uri}`"))?
            .next()
            .ok_or_else(|| anyhow!("no address resolved for `{uri}`"))?;
        return Ok(ResolvedUri {
            scheme,
            endpoint: Endpoint::Socket(unspecified),
            host: host.to_string(),
        });
    }

    let host_for_lookup = host.trim_start_matches('[').trim_end_matches(']');
    let addr = (host_for_lookup, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving `{uri}`"))?
        .next()
        .ok_or_else(|| anyhow!("no address resolved for `{uri}`"))?;

    Ok(ResolvedUri {
        scheme,
        endpoint: Endpoint::Socket(addr),
        host: host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_tcp_loopback() {
        let r = resolve("tcp://127.0.0.1:9000/", false).unwrap();
        assert_eq!(r.scheme, Scheme::Tcp);
        match r.endpoint {
            Endpoint::Socket(addr) => assert_eq!(addr.port(), 9000),
            _ => panic!("expected a socket endpoint"),
        }
    }

    #[test]
    fn resolves_shm_name() {
        let r = resolve("shm://my-segment", false).unwrap();
        assert_eq!(r.scheme, Scheme::Shm);
        match r.endpoint {
            Endpoint::Shm(name) => assert_eq!(name, "my-segment"),
            _ => panic!("expected a shm endpoint"),
        }
    }

    #[test]
    fn bind_any_requires_server_side() {
        assert!(resolve("udp://*:9000/", false).is_err());
        assert!(resolve("udp://*:9000/", true).is_ok());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(resolve("ftp://host:21/", false).is_err());
    }

    #[test]
    fn missing_port_is_rejected() {
        assert!(resolve("tcp://127.0.0.1/", false).is_err());
    }
}
