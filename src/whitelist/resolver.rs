//! Whitelist snapshot maintenance.
//!
//! The resolver owns the authoritative permission snapshot. Refresh cycles
//! rebuild the range list from the parsed entries and re-resolve every
//! hostname concurrently, then swap in a whole new snapshot. Readers clone
//! the `Arc` under a short read lock; the lock is never held across I/O.

use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::whitelist::WhitelistEntry;

/// Immutable view of the whitelist at one point in time.
#[derive(Debug, Clone, Default)]
pub struct WhitelistSnapshot {
    /// Addresses gathered from hostname resolution. Accumulates across
    /// refresh cycles: an address stays whitelisted even if a later cycle
    /// fails to re-resolve its host.
    ips: HashSet<Ipv4Addr>,
    /// Parsed literal ranges, rebuilt from scratch every cycle.
    ranges: Vec<Ipv4Net>,
    /// Configured literal hostnames, matched case-insensitively against
    /// the original request host.
    hostnames: Vec<String>,
}

impl WhitelistSnapshot {
    /// True if the destination is permitted. First true branch wins.
    pub fn permits(&self, ip: Ipv4Addr, original_host: &str) -> bool {
        if self.ips.contains(&ip) {
            return true;
        }
        if self.ranges.iter().any(|net| net.contains(&ip)) {
            return true;
        }
        self.hostnames
            .iter()
            .any(|host| host.eq_ignore_ascii_case(original_host))
    }

    pub fn resolved_ip_count(&self) -> usize {
        self.ips.len()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }
}

pub struct WhitelistResolver {
    entries: Vec<WhitelistEntry>,
    refresh_interval: Duration,
    snapshot: RwLock<Arc<WhitelistSnapshot>>,
}

impl WhitelistResolver {
    pub fn new(entries: Vec<WhitelistEntry>, refresh_interval: Duration) -> Self {
        let hostnames = entries
            .iter()
            .filter_map(|e| match e {
                WhitelistEntry::Hostname(host) => Some(host.clone()),
                WhitelistEntry::Range(_) => None,
            })
            .collect();

        let initial = WhitelistSnapshot {
            ips: HashSet::new(),
            ranges: Vec::new(),
            hostnames,
        };

        Self {
            entries,
            refresh_interval,
            snapshot: RwLock::new(Arc::new(initial)),
        }
    }

    /// Current snapshot. The read lock is held only for the `Arc` clone.
    pub fn snapshot(&self) -> Arc<WhitelistSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_whitelisted(&self, ip: Ipv4Addr, original_host: &str) -> bool {
        self.snapshot().permits(ip, original_host)
    }

    /// Run one full refresh cycle: resolve hostnames concurrently, rebuild
    /// ranges, swap the snapshot.
    pub async fn refresh(&self) {
        let resolved = self.resolve_hostnames().await;
        self.rebuild(resolved);

        let snapshot = self.snapshot();
        info!(
            resolved_ips = snapshot.resolved_ip_count(),
            ranges = snapshot.range_count(),
            "Whitelist refreshed"
        );
    }

    /// Refresh once at startup, then on the configured interval until the
    /// token is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        self.refresh().await;

        let mut ticker = tokio::time::interval(self.refresh_interval);
        // Skip the first tick which fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Whitelist refresh loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
    }

    /// Resolve every hostname entry concurrently, one task per entry.
    /// Failures are logged and contribute nothing this cycle.
    async fn resolve_hostnames(&self) -> Vec<Ipv4Addr> {
        let mut tasks = JoinSet::new();

        for entry in &self.entries {
            let WhitelistEntry::Hostname(host) = entry else {
                continue;
            };
            let host = host.clone();
            tasks.spawn(async move {
                match tokio::net::lookup_host((host.as_str(), 0u16)).await {
                    Ok(addrs) => {
                        let ips: Vec<Ipv4Addr> = addrs
                            .filter_map(|addr| match addr.ip() {
                                IpAddr::V4(v4) => Some(v4),
                                IpAddr::V6(_) => None,
                            })
                            .collect();
                        if ips.is_empty() {
                            warn!(host = %host, "No IPv4 addresses found for host");
                        } else {
                            debug!(host = %host, ?ips, "Resolved whitelist host");
                        }
                        ips
                    }
                    Err(err) => {
                        warn!(host = %host, error = %err, "Failed to resolve whitelist host");
                        Vec::new()
                    }
                }
            });
        }

        let mut resolved = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(ips) => resolved.extend(ips),
                Err(err) => warn!(error = %err, "Hostname resolution task panicked"),
            }
        }
        resolved
    }

    /// Build the next snapshot and swap it in wholesale. The resolved-IP
    /// set carries over from the previous snapshot before the new
    /// resolutions are added.
    fn rebuild(&self, resolved: Vec<Ipv4Addr>) {
        let ranges: Vec<Ipv4Net> = self
            .entries
            .iter()
            .filter_map(|e| match e {
                WhitelistEntry::Range(net) => Some(*net),
                WhitelistEntry::Hostname(_) => None,
            })
            .collect();

        let previous = self.snapshot();
        let mut ips = previous.ips.clone();
        ips.extend(resolved);

        let next = WhitelistSnapshot {
            ips,
            ranges,
            hostnames: previous.hostnames.clone(),
        };

        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(next);
    }
}
