//! Statistics storage and API models.

use serde::{Deserialize, Serialize};

/// One proxied connection, as persisted. Created with zero counters and
/// null close fields; the close fields are filled in exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConnectionRecord {
    pub id: i64,
    pub client_ip: String,
    pub target_addr: String,
    pub country: String,
    pub city: String,
    pub bytes_in: i64,
    pub bytes_out: i64,
    /// Unix seconds.
    pub connected_at: i64,
    /// Unix seconds; null while the connection is open.
    pub disconnected_at: Option<i64>,
    /// Seconds; null while the connection is open.
    pub duration: Option<i64>,
}

/// Singleton monotonic server totals (row id = 1).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ServerTotals {
    pub start_time: i64,
    pub total_connections: i64,
    pub total_bytes_in: i64,
    pub total_bytes_out: i64,
    pub updated_at: i64,
}

/// Monotonic per-country totals.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GeoTotals {
    pub country: String,
    pub country_name: String,
    pub connections: i64,
    pub total_bytes: i64,
    pub last_updated: i64,
}

/// One country slice of the public stats response.
#[derive(Debug, Clone, Serialize)]
pub struct CountryStats {
    pub country: String,
    pub country_name: String,
    pub connections: i64,
    pub percentage: f64,
}

/// Public statistics composition returned by the reporting API.
#[derive(Debug, Clone, Serialize)]
pub struct PublicStats {
    pub uptime_seconds: i64,
    pub total_connections: i64,
    pub active_connections: i64,
    pub total_traffic_gb: f64,
    pub countries: Vec<CountryStats>,
    pub updated_at: i64,
}

/// Geographic location derived from a client IP.
#[derive(Debug, Clone, Default)]
pub struct GeoLocation {
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub city: Option<String>,
}
