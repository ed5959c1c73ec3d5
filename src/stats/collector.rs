//! Statistics collector: tracker lifecycle, public stats composition and
//! the retention sweep.

use anyhow::Result;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stats::geoip::GeoIpService;
use crate::stats::models::{CountryStats, PublicStats};
use crate::stats::store::StatsStore;
use crate::stats::tracker::ConnectionTracker;

const TOP_COUNTRIES: i64 = 20;
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct StatsCollector {
    store: StatsStore,
    geoip: Option<GeoIpService>,
    active: DashMap<i64, Arc<ConnectionTracker>>,
    active_count: AtomicI64,
    started: Instant,
    retention_days: u32,
}

impl StatsCollector {
    pub fn new(store: StatsStore, geoip: Option<GeoIpService>, retention_days: u32) -> Arc<Self> {
        Arc::new(Self {
            store,
            geoip,
            active: DashMap::new(),
            active_count: AtomicI64::new(0),
            started: Instant::now(),
            retention_days,
        })
    }

    pub fn store(&self) -> &StatsStore {
        &self.store
    }

    pub fn active_connections(&self) -> i64 {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Start tracking a freshly authorized connection.
    ///
    /// Returns `None` if the record insert fails: the connection proceeds
    /// untracked rather than being denied.
    pub async fn track_connection(
        self: &Arc<Self>,
        client_ip: &str,
        target_addr: &str,
    ) -> Option<Arc<ConnectionTracker>> {
        let (country, country_name, city) = self.locate(client_ip);
        let connected_at = chrono::Utc::now().timestamp();

        let id = match self
            .store
            .insert_connection(client_ip, target_addr, &country, &city, connected_at)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "Failed to insert connection record, proceeding untracked");
                return None;
            }
        };

        self.active_count.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.store.bump_server_totals(1, 0, 0, connected_at).await {
            warn!(error = %err, "Failed to bump server totals");
        }
        if country != "Unknown" {
            if let Err(err) = self
                .store
                .upsert_geo_totals(&country, &country_name, 1, 0, connected_at)
                .await
            {
                warn!(error = %err, "Failed to upsert geo totals");
            }
        }

        let tracker = Arc::new(ConnectionTracker::new(
            id,
            country.clone(),
            country_name,
            Arc::clone(self),
        ));
        self.active.insert(id, Arc::clone(&tracker));

        info!(
            id,
            client = %client_ip,
            target = %target_addr,
            country = %country,
            "Tracking new connection"
        );

        Some(tracker)
    }

    /// Close-side bookkeeping, invoked once by the tracker's guarded close.
    /// The connection-count delta was already applied at creation; only
    /// byte deltas are added here.
    pub(crate) async fn on_tracker_closed(
        &self,
        id: i64,
        country: &str,
        country_name: &str,
        bytes_in: i64,
        bytes_out: i64,
    ) {
        self.active_count.fetch_sub(1, Ordering::Relaxed);

        let now = chrono::Utc::now().timestamp();
        if let Err(err) = self
            .store
            .bump_server_totals(0, bytes_in, bytes_out, now)
            .await
        {
            warn!(id, error = %err, "Failed to bump server totals on close");
        }
        if country != "Unknown" {
            if let Err(err) = self
                .store
                .upsert_geo_totals(country, country_name, 0, bytes_in + bytes_out, now)
                .await
            {
                warn!(id, error = %err, "Failed to upsert geo totals on close");
            }
        }

        self.active.remove(&id);
    }

    /// Compose the public statistics snapshot.
    pub async fn public_stats(&self) -> Result<PublicStats> {
        let totals = self.store.server_totals().await?;
        let total_bytes = totals.total_bytes_in + totals.total_bytes_out;

        let top = self.store.top_countries(TOP_COUNTRIES).await?;
        // Percentages are relative to the sum of the returned top-N rows,
        // not the true global total. Kept for response compatibility.
        let denominator: i64 = top.iter().map(|g| g.connections).sum();
        let countries = top
            .into_iter()
            .map(|g| CountryStats {
                percentage: if denominator > 0 {
                    g.connections as f64 * 100.0 / denominator as f64
                } else {
                    0.0
                },
                country: g.country,
                country_name: g.country_name,
                connections: g.connections,
            })
            .collect();

        Ok(PublicStats {
            uptime_seconds: self.started.elapsed().as_secs() as i64,
            total_connections: totals.total_connections,
            active_connections: self.active_connections(),
            total_traffic_gb: total_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            countries,
            updated_at: chrono::Utc::now().timestamp(),
        })
    }

    /// Spawn the retention sweep: once immediately, then every 24 hours.
    /// Returns `None` when retention is disabled.
    pub fn spawn_retention_sweep(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if self.retention_days == 0 {
            info!("Retention policy disabled; skipping sweep task");
            return None;
        }

        let collector = Arc::clone(self);
        Some(tokio::spawn(async move {
            collector.sweep().await;

            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            // Skip the first tick which fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Retention sweep shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        collector.sweep().await;
                    }
                }
            }
        }))
    }

    pub(crate) async fn sweep(&self) {
        let cutoff =
            chrono::Utc::now().timestamp() - i64::from(self.retention_days) * 24 * 60 * 60;
        match self.store.prune_connections_before(cutoff).await {
            Ok(removed) => {
                info!(
                    removed,
                    retention_days = self.retention_days,
                    "Retention sweep completed"
                );
            }
            Err(err) => warn!(error = %err, "Retention sweep failed"),
        }
    }

    /// Finalize every remaining tracker. Used on graceful shutdown; racing
    /// an in-flight close is harmless because close is idempotent.
    pub async fn close_all(&self) {
        let trackers: Vec<Arc<ConnectionTracker>> =
            self.active.iter().map(|e| Arc::clone(e.value())).collect();
        for tracker in trackers {
            tracker.close().await;
        }
    }

    /// Country/city for a client IP. Every failure path degrades to
    /// "Unknown" without blocking or failing the dial.
    fn locate(&self, client_ip: &str) -> (String, String, String) {
        let Some(geoip) = &self.geoip else {
            return ("Unknown".to_string(), String::new(), String::new());
        };
        let Ok(ip) = client_ip.parse::<IpAddr>() else {
            return ("Unknown".to_string(), String::new(), String::new());
        };

        let location = geoip.lookup(ip);
        let country = location
            .country_code
            .unwrap_or_else(|| "Unknown".to_string());
        let country_name = location.country_name.unwrap_or_else(|| country.clone());
        let city = location.city.unwrap_or_default();
        (country, country_name, city)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collector_with_retention(retention_days: u32) -> Arc<StatsCollector> {
        let store = StatsStore::connect("sqlite::memory:", 1).await.unwrap();
        store.init(chrono::Utc::now().timestamp()).await.unwrap();
        StatsCollector::new(store, None, retention_days)
    }

    #[tokio::test]
    async fn tracking_increments_counters_and_active_set() {
        let c = collector_with_retention(0).await;

        let t1 = c.track_connection("10.0.0.1", "a:1").await.unwrap();
        let t2 = c.track_connection("10.0.0.2", "b:2").await.unwrap();
        assert_eq!(c.active_connections(), 2);

        let totals = c.store().server_totals().await.unwrap();
        assert_eq!(totals.total_connections, 2);

        t1.close().await;
        assert_eq!(c.active_connections(), 1);
        t2.close().await;
        assert_eq!(c.active_connections(), 0);

        // Connection count never decreases on close.
        let totals = c.store().server_totals().await.unwrap();
        assert_eq!(totals.total_connections, 2);
    }

    #[tokio::test]
    async fn insert_failure_yields_untracked_connection() {
        let c = collector_with_retention(0).await;
        sqlx::query("DROP TABLE connections")
            .execute(c.store().pool())
            .await
            .unwrap();

        assert!(c.track_connection("10.0.0.1", "a:1").await.is_none());
        assert_eq!(c.active_connections(), 0);
    }

    #[tokio::test]
    async fn public_stats_percentages_cover_returned_set() {
        let c = collector_with_retention(0).await;
        let now = chrono::Utc::now().timestamp();

        c.store().upsert_geo_totals("DE", "Germany", 6, 0, now).await.unwrap();
        c.store().upsert_geo_totals("FR", "France", 3, 0, now).await.unwrap();
        c.store().upsert_geo_totals("NL", "Netherlands", 1, 0, now).await.unwrap();

        let stats = c.public_stats().await.unwrap();
        assert_eq!(stats.countries.len(), 3);
        assert_eq!(stats.countries[0].country, "DE");
        assert!((stats.countries[0].percentage - 60.0).abs() < 1e-9);
        assert!((stats.countries[1].percentage - 30.0).abs() < 1e-9);
        assert!((stats.countries[2].percentage - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sweep_prunes_expired_rows_only() {
        let c = collector_with_retention(30).await;
        let now = chrono::Utc::now().timestamp();

        c.store()
            .insert_connection("10.0.0.1", "old:1", "", "", now - 90 * 86_400)
            .await
            .unwrap();
        let fresh = c
            .store()
            .insert_connection("10.0.0.2", "new:2", "", "", now)
            .await
            .unwrap();

        c.sweep().await;

        let remaining = c.store().recent_connections(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh);
    }

    #[tokio::test]
    async fn close_all_finalizes_remaining_trackers() {
        let c = collector_with_retention(0).await;
        let t = c.track_connection("10.0.0.1", "a:1").await.unwrap();
        t.add_bytes_in(7);

        c.close_all().await;

        assert!(t.is_closed());
        assert_eq!(c.active_connections(), 0);
        let record = c.store().get_connection(t.id()).await.unwrap().unwrap();
        assert_eq!(record.bytes_in, 7);
    }
}
