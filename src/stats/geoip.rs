//! GeoIP lookup service using MaxMind GeoLite2/GeoIP2 MMDB
//!
//! Memory-mapped MaxMind database, shared cheaply between tasks. Lookup
//! never fails a caller: anything that cannot be located comes back as a
//! default location, which the collector records as country "Unknown".

use anyhow::{Context, Result};
use maxminddb::{geoip2, Mmap, Reader};
use std::net::IpAddr;
use std::sync::Arc;

use crate::stats::models::GeoLocation;

pub struct GeoIpService {
    reader: Arc<Reader<Mmap>>,
}

impl GeoIpService {
    /// Open a MaxMind City (or Country) .mmdb file.
    pub fn new(path: &str) -> Result<Self> {
        let reader = unsafe { Reader::open_mmap(path) }
            .with_context(|| format!("Failed to open GeoIP database at {}", path))?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Lookup the country and city for an IP address.
    pub fn lookup(&self, ip: IpAddr) -> GeoLocation {
        let mut location = GeoLocation::default();

        if let Ok(result) = self.reader.lookup(ip) {
            if let Ok(Some(city)) = result.decode::<geoip2::City>() {
                location.country_code = city.country.iso_code.map(|s| s.to_string());
                location.country_name = city.country.names.english.map(|s| s.to_string());
                location.city = city.city.names.english.map(|s| s.to_string());
            } else if let Ok(Some(country)) = result.decode::<geoip2::Country>() {
                // Country-only database.
                location.country_code = country.country.iso_code.map(|s| s.to_string());
                location.country_name = country.country.names.english.map(|s| s.to_string());
            }
        }

        location
    }
}

impl Clone for GeoIpService {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_path_is_an_error() {
        assert!(GeoIpService::new("/nonexistent/path.mmdb").is_err());
    }
}
