use anyhow::Context;
use ipnet::Ipv4Net;
use std::time::Duration;
use tracing::warn;

use crate::whitelist::WhitelistEntry;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub whitelist: Vec<WhitelistEntry>,
    pub refresh_interval: Duration,
    pub egress_subnet: Ipv4Net,
    pub stats: StatsConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub enabled: bool,
    pub database_url: String,
    pub geoip_path: Option<String>,
    pub retention_days: u32,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
    pub api_key: Option<String>,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let listen = std::env::var("LISTEN").unwrap_or_else(|_| "0.0.0.0:6666".to_string());

        // Entries are tagged at parse time; an invalid CIDR is dropped here
        // with a warning instead of being re-inferred on every refresh.
        let whitelist = std::env::var("WHITELIST")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|raw| match raw.parse::<WhitelistEntry>() {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("Skipping whitelist entry {raw:?}: {err}");
                    None
                }
            })
            .collect();

        let refresh_interval = std::env::var("REFRESH_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        // An unparseable egress subnet is a fatal startup error.
        let egress_subnet = std::env::var("EGRESS_SUBNET")
            .context("EGRESS_SUBNET must be set (e.g. 192.0.2.0/24)")?
            .parse::<Ipv4Net>()
            .context("EGRESS_SUBNET is not a valid IPv4 CIDR")?;

        let stats_enabled = env_flag("STATS_ENABLED", true);
        let database_url = std::env::var("STATS_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/stats.db?mode=rwc".to_string());
        let geoip_path = std::env::var("STATS_GEOIP_PATH").ok();
        let retention_days = std::env::var("STATS_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(90);

        let api_enabled = env_flag("API_ENABLED", true);
        let api_listen = std::env::var("API_LISTEN").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let api_key = std::env::var("API_KEY").ok().filter(|k| !k.is_empty());
        let cors_origins = std::env::var("API_CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Config {
            listen,
            whitelist,
            refresh_interval,
            egress_subnet,
            stats: StatsConfig {
                enabled: stats_enabled,
                database_url,
                geoip_path,
                retention_days,
            },
            api: ApiConfig {
                enabled: api_enabled,
                listen: api_listen,
                api_key,
                cors_origins,
            },
        })
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}
