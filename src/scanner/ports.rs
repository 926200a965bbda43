//! Port specifications
//!
//! A spec is a comma list whose items are port numbers (`22`), inclusive
//! ranges (`8000-8100`), service aliases (`ssh`, `pgsql`) or list aliases
//! (`top100`, `top1000`, `all`, `web`).

use crate::top_ports::resolve_alias;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    ports: BTreeSet<u16>,
}

impl PortSpec {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut ports = BTreeSet::new();

        for item in spec.split(',').map(str::trim) {
            if item.is_empty() {
                continue;
            }

            if let Some(alias) = resolve_alias(item) {
                ports.extend(alias);
            } else if let Some((start, end)) = item.split_once('-') {
                let start = parse_port(start.trim(), spec)?;
                let end = parse_port(end.trim(), spec)?;
                if start > end {
                    return Err(format!("range {} is reversed", item));
                }
                ports.extend(start..=end);
            } else if item.chars().all(|c| c.is_ascii_digit()) {
                ports.insert(parse_port(item, spec)?);
            } else {
                return Err(format!("unknown port or service '{}'", item));
            }
        }

        if ports.is_empty() {
            return Err(format!("port spec '{}' selects no ports", spec));
        }

        Ok(Self { ports })
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    /// Sorted, deduplicated ports
    pub fn into_ports(self) -> Vec<u16> {
        self.ports.into_iter().collect()
    }
}

fn parse_port(value: &str, spec: &str) -> Result<u16, String> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port '{}' in '{}'", value, spec)),
        Ok(port) => Ok(port),
    }
}
