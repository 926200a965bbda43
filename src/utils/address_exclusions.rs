//! Address exclusion set
//!
//! Exclusions accept the same grammars as targets, but ranges and CIDR blocks
//! are kept as intervals instead of being expanded, so excluding a large block
//! costs nothing.

use crate::error::EngineError;
use crate::Result;
use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

#[derive(Debug, Clone, Default)]
pub struct AddressExclusions {
    addresses: HashSet<IpAddr>,
    ranges: Vec<(IpAddr, IpAddr)>,
    networks: Vec<IpNetwork>,
}

impl AddressExclusions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an exclusion set from a list of specs
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        let mut excluder = Self::new();
        for spec in specs {
            excluder.add_exclusion(spec.as_ref())?;
        }
        Ok(excluder)
    }

    /// Add a single exclusion (IP, range, or CIDR)
    pub fn add_exclusion(&mut self, exclusion: &str) -> Result<()> {
        let exclusion = exclusion.trim();
        if exclusion.is_empty() {
            return Err(EngineError::InvalidTargetSpec("empty exclusion".to_string()));
        }

        if exclusion.contains('/') {
            let network = IpNetwork::from_str(exclusion)
                .map_err(|e| EngineError::InvalidTargetSpec(format!("'{}': {}", exclusion, e)))?;
            self.networks.push(network);
        } else if exclusion.contains('-') {
            self.add_range(exclusion)?;
        } else {
            let addr = IpAddr::from_str(exclusion).map_err(|_| {
                EngineError::InvalidTargetSpec(format!("invalid exclusion: {}", exclusion))
            })?;
            self.addresses.insert(addr);
        }

        Ok(())
    }

    fn add_range(&mut self, range_str: &str) -> Result<()> {
        let invalid = || EngineError::InvalidTargetSpec(format!("invalid exclusion range: {}", range_str));

        let (start_str, end_str) = range_str.split_once('-').ok_or_else(invalid)?;
        let start = IpAddr::from_str(start_str.trim()).map_err(|_| invalid())?;
        let end = match (start, IpAddr::from_str(end_str.trim())) {
            (_, Ok(end)) => end,
            (IpAddr::V4(start4), Err(_)) => {
                let last: u8 = end_str.trim().parse().map_err(|_| invalid())?;
                let [a, b, c, _] = start4.octets();
                IpAddr::V4(Ipv4Addr::new(a, b, c, last))
            }
            (IpAddr::V6(_), Err(_)) => return Err(invalid()),
        };

        if start.is_ipv4() != end.is_ipv4() || start > end {
            return Err(invalid());
        }

        self.ranges.push((start, end));
        Ok(())
    }

    /// Check if an IP address should be excluded
    pub fn is_excluded(&self, addr: IpAddr) -> bool {
        self.addresses.contains(&addr)
            || self
                .ranges
                .iter()
                .any(|(start, end)| start.is_ipv4() == addr.is_ipv4() && addr >= *start && addr <= *end)
            || self.networks.iter().any(|network| network.contains(addr))
    }

    /// Filter a list of IP addresses
    pub fn filter_addresses(&self, addresses: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
        addresses.into_iter().filter(|addr| !self.is_excluded(*addr)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.ranges.is_empty() && self.networks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_single_address() {
        let ex = AddressExclusions::from_specs(&["192.168.1.108"]).unwrap();
        assert!(ex.is_excluded(ip("192.168.1.108")));
        assert!(!ex.is_excluded(ip("192.168.1.109")));
    }

    #[test]
    fn test_range_and_shorthand() {
        let ex = AddressExclusions::from_specs(&["10.0.0.1-10.0.0.5", "10.0.1.10-12"]).unwrap();
        assert!(ex.is_excluded(ip("10.0.0.3")));
        assert!(ex.is_excluded(ip("10.0.1.12")));
        assert!(!ex.is_excluded(ip("10.0.0.6")));
        assert!(!ex.is_excluded(ip("10.0.1.13")));
    }

    #[test]
    fn test_cidr_blocks() {
        let ex = AddressExclusions::from_specs(&["172.16.0.0/12", "fe80::/10"]).unwrap();
        assert!(ex.is_excluded(ip("172.20.1.1")));
        assert!(ex.is_excluded(ip("fe80::1")));
        assert!(!ex.is_excluded(ip("172.32.0.1")));
    }

    #[test]
    fn test_invalid_exclusions() {
        assert!(AddressExclusions::from_specs(&["not-an-ip"]).is_err());
        assert!(AddressExclusions::from_specs(&["10.0.0.9-10.0.0.1"]).is_err());
        assert!(AddressExclusions::from_specs(&["10.0.0.0/33"]).is_err());
    }

    #[test]
    fn test_filter_addresses() {
        let ex = AddressExclusions::from_specs(&["10.0.0.2"]).unwrap();
        let kept = ex.filter_addresses(vec![ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")]);
        assert_eq!(kept, vec![ip("10.0.0.1"), ip("10.0.0.3")]);
    }
}
