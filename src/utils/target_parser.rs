//! Target parsing for single addresses, dash ranges and CIDR blocks
//!
//! Supported grammars:
//! - single IPv4 or IPv6 address (`192.168.1.10`, `2001:db8::1`)
//! - full dash range (`192.168.1.0-192.168.1.255`, same family, start <= end)
//! - last-octet shorthand (`192.168.1.10-20`)
//! - CIDR notation for both families (`10.0.0.0/24`, `2001:db8::/120`)

use crate::error::EngineError;
use crate::Result;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Default cap on how many addresses one spec may expand to
pub const DEFAULT_MAX_ADDRESSES: u64 = 65_536;

/// Represents a parsed target spec with its expanded addresses
#[derive(Debug, Clone)]
pub struct ParsedTarget {
    pub original: String,
    pub target_type: TargetType,
    pub addresses: Vec<IpAddr>,
}

/// Grammar a target spec matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    SingleIpv4,
    SingleIpv6,
    Ipv4Range,
    Ipv6Range,
    Ipv4Cidr,
    Ipv6Cidr,
}

/// Target parser with IPv6, range and CIDR support
#[derive(Debug, Clone)]
pub struct TargetParser {
    max_addresses: u64,
}

impl Default for TargetParser {
    fn default() -> Self {
        Self {
            max_addresses: DEFAULT_MAX_ADDRESSES,
        }
    }
}

impl TargetParser {
    pub fn new(max_addresses: u64) -> Self {
        Self { max_addresses }
    }

    /// Parse a target string into a ParsedTarget
    pub fn parse_target(&self, target: &str) -> Result<ParsedTarget> {
        let target = target.trim();
        if target.is_empty() {
            return Err(EngineError::InvalidTargetSpec("empty target".to_string()));
        }

        let (target_type, addresses) = if target.contains('/') {
            self.parse_cidr(target)?
        } else if target.contains('-') {
            self.parse_range(target)?
        } else {
            match IpAddr::from_str(target) {
                Ok(ip @ IpAddr::V4(_)) => (TargetType::SingleIpv4, vec![ip]),
                Ok(ip @ IpAddr::V6(_)) => (TargetType::SingleIpv6, vec![ip]),
                Err(_) => {
                    return Err(EngineError::InvalidTargetSpec(format!(
                        "'{}' is not an address, range or CIDR block",
                        target
                    )))
                }
            }
        };

        Ok(ParsedTarget {
            original: target.to_string(),
            target_type,
            addresses,
        })
    }

    /// Expand `addr/prefix` into every address of the block
    fn parse_cidr(&self, target: &str) -> Result<(TargetType, Vec<IpAddr>)> {
        let network = IpNetwork::from_str(target)
            .map_err(|e| EngineError::InvalidTargetSpec(format!("'{}': {}", target, e)))?;

        let host_bits = match network {
            IpNetwork::V4(_) => 32 - network.prefix() as u32,
            IpNetwork::V6(_) => 128 - network.prefix() as u32,
        };
        self.check_size(target, host_bits)?;

        match network {
            IpNetwork::V4(net) => {
                let base = u32::from(net.network());
                let count = 1u64 << host_bits;
                let addresses = (0..count)
                    .map(|i| IpAddr::V4(Ipv4Addr::from(base.wrapping_add(i as u32))))
                    .collect();
                Ok((TargetType::Ipv4Cidr, addresses))
            }
            IpNetwork::V6(net) => {
                let base = u128::from(net.network());
                let count = 1u128 << host_bits;
                let addresses = (0..count)
                    .map(|i| IpAddr::V6(Ipv6Addr::from(base.wrapping_add(i))))
                    .collect();
                Ok((TargetType::Ipv6Cidr, addresses))
            }
        }
    }

    /// Expand `start-end` or the `a.b.c.d-e` shorthand
    fn parse_range(&self, target: &str) -> Result<(TargetType, Vec<IpAddr>)> {
        let (start_str, end_str) = target
            .split_once('-')
            .ok_or_else(|| EngineError::InvalidTargetSpec(format!("invalid range: {}", target)))?;
        let (start_str, end_str) = (start_str.trim(), end_str.trim());

        let start = IpAddr::from_str(start_str).map_err(|_| {
            EngineError::InvalidTargetSpec(format!("invalid range start '{}' in {}", start_str, target))
        })?;

        let end = match (start, IpAddr::from_str(end_str)) {
            (_, Ok(end)) => end,
            (IpAddr::V4(start4), Err(_)) => {
                // Shorthand: only the last octet is given
                let last: u8 = end_str.parse().map_err(|_| {
                    EngineError::InvalidTargetSpec(format!("invalid range end '{}' in {}", end_str, target))
                })?;
                let [a, b, c, _] = start4.octets();
                IpAddr::V4(Ipv4Addr::new(a, b, c, last))
            }
            (IpAddr::V6(_), Err(_)) => {
                return Err(EngineError::InvalidTargetSpec(format!(
                    "invalid range end '{}' in {}",
                    end_str, target
                )))
            }
        };

        match (start, end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => {
                let (s, e) = (u32::from(s), u32::from(e));
                if s > e {
                    return Err(EngineError::InvalidTargetSpec(format!(
                        "range start is after range end: {}",
                        target
                    )));
                }
                self.check_count(target, (e - s) as u128 + 1)?;
                let addresses = (s..=e).map(|v| IpAddr::V4(Ipv4Addr::from(v))).collect();
                Ok((TargetType::Ipv4Range, addresses))
            }
            (IpAddr::V6(s), IpAddr::V6(e)) => {
                let (s, e) = (u128::from(s), u128::from(e));
                if s > e {
                    return Err(EngineError::InvalidTargetSpec(format!(
                        "range start is after range end: {}",
                        target
                    )));
                }
                self.check_count(target, (e - s).saturating_add(1))?;
                let addresses = (s..=e).map(|v| IpAddr::V6(Ipv6Addr::from(v))).collect();
                Ok((TargetType::Ipv6Range, addresses))
            }
            _ => Err(EngineError::InvalidTargetSpec(format!(
                "range mixes IPv4 and IPv6: {}",
                target
            ))),
        }
    }

    fn check_size(&self, target: &str, host_bits: u32) -> Result<()> {
        if host_bits >= 64 {
            return Err(EngineError::InvalidTargetSpec(format!(
                "{} is too large to expand (max {} addresses)",
                target, self.max_addresses
            )));
        }
        self.check_count(target, 1u128 << host_bits)
    }

    fn check_count(&self, target: &str, count: u128) -> Result<()> {
        if count > self.max_addresses as u128 {
            return Err(EngineError::InvalidTargetSpec(format!(
                "{} expands to {} addresses (max {})",
                target, count, self.max_addresses
            )));
        }
        Ok(())
    }
}
