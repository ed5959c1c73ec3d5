//! Connection statistics: per-connection tracking, durable aggregates and
//! the retention sweep.

pub mod collector;
pub mod geoip;
pub mod models;
pub mod store;
pub mod tracker;

pub use collector::StatsCollector;
pub use geoip::GeoIpService;
pub use models::{ConnectionRecord, CountryStats, GeoTotals, PublicStats, ServerTotals};
pub use store::StatsStore;
pub use tracker::{ConnectionTracker, TrackedStream};
