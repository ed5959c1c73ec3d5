//! Dial authorization and the egress dial itself.
//!
//! Every authorized dial draws a fresh random source address from the owned
//! subnet and binds it with `IP_FREEBIND` where the platform supports it, so
//! the address does not need to be configured on a local interface. Dial
//! failures are surfaced verbatim; there is no retry and no fallback
//! address.

use ipnet::Ipv4Net;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::debug;

use crate::whitelist::WhitelistResolver;

/// Requested transport family, normalized to IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Tcp,
    Udp,
}

impl NetworkKind {
    /// Accepts the protocol layer's network names. Anything that is not a
    /// TCP or UDP family is rejected before the dial stage.
    pub fn parse(network: &str) -> Result<Self, DialError> {
        match network {
            "tcp" | "tcp4" | "tcp6" => Ok(NetworkKind::Tcp),
            "udp" | "udp4" | "udp6" => Ok(NetworkKind::Udp),
            other => Err(DialError::UnsupportedNetwork(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid target address {0:?}")]
    InvalidTarget(String),
    #[error("unsupported network kind {0:?}")]
    UnsupportedNetwork(String),
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("{host} did not resolve to an IPv4 address")]
    NoIpv4 { host: String },
    #[error("ip {ip} is not in the whitelist")]
    NotWhitelisted { ip: Ipv4Addr },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An established outbound connection.
pub enum EgressConn {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// A destination that passed resolution and whitelist authorization.
#[derive(Debug, Clone)]
pub struct AuthorizedTarget {
    pub host: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

pub struct EgressDialer {
    subnet: Ipv4Net,
    resolver: Arc<WhitelistResolver>,
}

impl EgressDialer {
    pub fn new(subnet: Ipv4Net, resolver: Arc<WhitelistResolver>) -> Self {
        Self { subnet, resolver }
    }

    /// Resolve and authorize a `host:port` target. Resolution failure
    /// denies the request; a denial is a normal outcome, not a fault.
    pub async fn authorize(&self, target: &str) -> Result<AuthorizedTarget, DialError> {
        let (host, port) = split_target(target)?;

        let ip = resolve_ipv4(&host, port).await?;

        if !self.resolver.is_whitelisted(ip, &host) {
            return Err(DialError::NotWhitelisted { ip });
        }

        Ok(AuthorizedTarget { host, ip, port })
    }

    /// Draw one source address uniformly at random from the subnet's
    /// usable host range. A fresh draw every dial, no affinity.
    pub fn pick_source(&self) -> Ipv4Addr {
        let prefix = self.subnet.prefix_len();
        if prefix >= 31 {
            return self.subnet.network();
        }

        use rand::RngExt;
        let mut rng = rand::rng();
        let size = 1u64 << (32 - prefix);
        // Exclude the network and broadcast addresses.
        let offset = rng.random_range(1..size - 1) as u32;
        Ipv4Addr::from(u32::from(self.subnet.network()) + offset)
    }

    /// Authorize the target, then dial it from a random subnet address.
    pub async fn dial(&self, kind: NetworkKind, target: &str) -> Result<EgressConn, DialError> {
        let authorized = self.authorize(target).await?;
        let source = self.pick_source();
        let remote = SocketAddr::new(IpAddr::V4(authorized.ip), authorized.port);

        debug!(?kind, target = %target, source = %source, "Dialing egress connection");

        match kind {
            NetworkKind::Tcp => {
                let socket = TcpSocket::new_v4()?;
                apply_freebind(&socket);
                socket.bind(SocketAddr::new(IpAddr::V4(source), 0))?;
                let stream = socket.connect(remote).await?;
                Ok(EgressConn::Tcp(stream))
            }
            NetworkKind::Udp => {
                let socket = socket2::Socket::new(
                    socket2::Domain::IPV4,
                    socket2::Type::DGRAM,
                    Some(socket2::Protocol::UDP),
                )?;
                apply_freebind(&socket);
                socket.set_nonblocking(true)?;
                socket.bind(&SocketAddr::new(IpAddr::V4(source), 0).into())?;
                socket.connect(&remote.into())?;
                let std_socket: std::net::UdpSocket = socket.into();
                Ok(EgressConn::Udp(UdpSocket::from_std(std_socket)?))
            }
        }
    }
}

/// Set `IP_FREEBIND` best-effort: if the platform or privilege level does
/// not support it, the dial proceeds without it.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn apply_freebind(socket: &impl std::os::fd::AsFd) {
    if let Err(err) = socket2::SockRef::from(socket).set_freebind(true) {
        debug!(error = %err, "IP_FREEBIND not applied, continuing without it");
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn apply_freebind<T>(_socket: &T) {}

fn split_target(target: &str) -> Result<(String, u16), DialError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| DialError::InvalidTarget(target.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| DialError::InvalidTarget(target.to_string()))?;
    if host.is_empty() {
        return Err(DialError::InvalidTarget(target.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Resolve a host to its first IPv4 answer. Fail-closed: a host that does
/// not resolve, or resolves to IPv6 only, never reaches the whitelist
/// check.
async fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr, DialError> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| DialError::Resolve {
            host: host.to_string(),
            source,
        })?;

    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| DialError::NoIpv4 {
            host: host.to_string(),
        })
}
