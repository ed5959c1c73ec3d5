use ipnet::Ipv4Net;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A single configured whitelist entry.
///
/// The variant is decided once, when configuration is parsed; nothing
/// downstream inspects the string shape again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistEntry {
    /// A literal CIDR range, e.g. `10.0.0.0/8`.
    Range(Ipv4Net),
    /// A hostname to be re-resolved on every refresh cycle, e.g. `example.com`.
    Hostname(String),
}

#[derive(Debug, Error)]
pub enum WhitelistEntryError {
    #[error("invalid CIDR range {0:?}: {1}")]
    InvalidRange(String, ipnet::AddrParseError),
    #[error("empty whitelist entry")]
    Empty,
}

impl FromStr for WhitelistEntry {
    type Err = WhitelistEntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(WhitelistEntryError::Empty);
        }
        if s.contains('/') {
            let net = s
                .parse::<Ipv4Net>()
                .map_err(|e| WhitelistEntryError::InvalidRange(s.to_string(), e))?;
            Ok(WhitelistEntry::Range(net))
        } else {
            Ok(WhitelistEntry::Hostname(s.to_string()))
        }
    }
}

impl fmt::Display for WhitelistEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WhitelistEntry::Range(net) => write!(f, "{net}"),
            WhitelistEntry::Hostname(host) => write!(f, "{host}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cidr_as_range() {
        let entry: WhitelistEntry = "10.0.0.0/8".parse().unwrap();
        assert_eq!(
            entry,
            WhitelistEntry::Range("10.0.0.0/8".parse::<Ipv4Net>().unwrap())
        );
    }

    #[test]
    fn parses_plain_name_as_hostname() {
        let entry: WhitelistEntry = "example.com".parse().unwrap();
        assert_eq!(entry, WhitelistEntry::Hostname("example.com".to_string()));
    }

    #[test]
    fn bare_ip_is_treated_as_hostname() {
        // A literal address without a prefix resolves to itself at
        // refresh time, so it does not need a dedicated variant.
        let entry: WhitelistEntry = "93.184.216.34".parse().unwrap();
        assert!(matches!(entry, WhitelistEntry::Hostname(_)));
    }

    #[test]
    fn rejects_invalid_cidr() {
        assert!("10.0.0.0/99".parse::<WhitelistEntry>().is_err());
        assert!("not-a-net/8".parse::<WhitelistEntry>().is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!("   ".parse::<WhitelistEntry>().is_err());
    }
}
