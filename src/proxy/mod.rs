//! SOCKS5 front-end.
//!
//! Accepts plain (no-auth) SOCKS5 clients, supports `CONNECT` only, and
//! hands every authorized target to the egress dialer. The protocol layer
//! never resolves domains itself; resolution happens inside the dialer so
//! an unresolvable host is denied rather than dialed.

use fast_socks5::{
    server::Socks5ServerProtocol, util::target_addr::TargetAddr, ReplyError, Socks5Command,
    SocksError,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::egress::{DialError, EgressConn, EgressDialer, NetworkKind};
use crate::stats::StatsCollector;

pub struct ProxyServer {
    dialer: Arc<EgressDialer>,
    collector: Option<Arc<StatsCollector>>,
}

impl ProxyServer {
    pub fn new(dialer: Arc<EgressDialer>, collector: Option<Arc<StatsCollector>>) -> Self {
        Self { dialer, collector }
    }

    /// Accept loop. Each client runs in its own task carrying a child
    /// token, so cancelling `shutdown` stops the loop and unwinds every
    /// in-flight session.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Proxy accept loop shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            debug!(client = %client_addr, "Client connected");
                            let dialer = Arc::clone(&self.dialer);
                            let collector = self.collector.clone();
                            let scope = shutdown.child_token();
                            tokio::spawn(async move {
                                if let Err(err) =
                                    handle_client(stream, client_addr, dialer, collector, scope)
                                        .await
                                {
                                    debug!(client = %client_addr, error = %err, "Session ended with error");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "Accept failed, continuing");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    client_addr: SocketAddr,
    dialer: Arc<EgressDialer>,
    collector: Option<Arc<StatsCollector>>,
    scope: CancellationToken,
) -> Result<(), SocksError> {
    let proto = Socks5ServerProtocol::accept_no_auth(stream).await?;
    let (proto, cmd, target_addr) = proto.read_command().await?;

    if cmd != Socks5Command::TCPConnect {
        proto.reply_error(&ReplyError::CommandNotSupported).await?;
        warn!(client = %client_addr, command = ?cmd, "Unsupported SOCKS5 command rejected");
        return Err(ReplyError::CommandNotSupported.into());
    }

    // Keep the original form of the target: a domain target is whitelisted
    // by name as well as by its resolved address.
    let target = match &target_addr {
        TargetAddr::Ip(addr) => addr.to_string(),
        TargetAddr::Domain(host, port) => format!("{host}:{port}"),
    };

    let outbound = match dialer.dial(NetworkKind::Tcp, &target).await {
        Ok(EgressConn::Tcp(stream)) => stream,
        Ok(EgressConn::Udp(_)) => {
            proto.reply_error(&ReplyError::GeneralFailure).await?;
            return Err(ReplyError::GeneralFailure.into());
        }
        Err(err) => {
            let reply = reply_for(&err);
            info!(client = %client_addr, target = %target, error = %err, "Egress dial rejected");
            proto.reply_error(&reply).await?;
            return Err(reply.into());
        }
    };

    let bound = outbound
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

    let tracker = match &collector {
        Some(collector) => {
            collector
                .track_connection(&client_addr.ip().to_string(), &target)
                .await
        }
        None => None,
    };

    let mut inbound = proto.reply_success(bound).await?;

    match tracker {
        Some(tracker) => {
            let mut outbound = tracker.wrap(outbound);
            let relayed = tokio::select! {
                res = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => res,
                _ = scope.cancelled() => Ok((0, 0)),
            };
            // Finalized exactly once whichever way the relay ended.
            tracker.close().await;
            if let Err(err) = relayed {
                debug!(client = %client_addr, target = %target, error = %err, "Relay ended with error");
            }
        }
        None => {
            let mut outbound = outbound;
            let relayed = tokio::select! {
                res = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => res,
                _ = scope.cancelled() => Ok((0, 0)),
            };
            if let Err(err) = relayed {
                debug!(client = %client_addr, target = %target, error = %err, "Relay ended with error");
            }
        }
    }

    Ok(())
}

/// Map a dial failure onto the closest SOCKS5 reply code.
fn reply_for(err: &DialError) -> ReplyError {
    match err {
        DialError::NotWhitelisted { .. } => ReplyError::ConnectionNotAllowed,
        DialError::InvalidTarget(_) | DialError::Resolve { .. } | DialError::NoIpv4 { .. } => {
            ReplyError::HostUnreachable
        }
        DialError::UnsupportedNetwork(_) => ReplyError::AddressTypeNotSupported,
        DialError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::ConnectionRefused => ReplyError::ConnectionRefused,
            std::io::ErrorKind::TimedOut => ReplyError::TtlExpired,
            _ => ReplyError::GeneralFailure,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_errors_map_to_socks_replies() {
        let denied = DialError::NotWhitelisted {
            ip: Ipv4Addr::new(8, 8, 8, 8),
        };
        assert!(matches!(
            reply_for(&denied),
            ReplyError::ConnectionNotAllowed
        ));

        let refused = DialError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(reply_for(&refused), ReplyError::ConnectionRefused));

        let unresolved = DialError::NoIpv4 {
            host: "nowhere.invalid".to_string(),
        };
        assert!(matches!(reply_for(&unresolved), ReplyError::HostUnreachable));
    }
}
