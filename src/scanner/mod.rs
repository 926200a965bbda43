//! Port scan stage

pub mod engine;
pub mod ports;

use crate::network::protocol::ServiceDatabase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

pub use engine::PortScanEngine;
pub use ports::PortSpec;

/// An open port, with the usual service name when one is known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPort {
    pub port: u16,
    pub service: Option<String>,
}

impl OpenPort {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            service: ServiceDatabase::global().get_tcp_service(port).map(str::to_string),
        }
    }
}

/// What the job stage knows about ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMap {
    /// Port scanning was disabled
    Unavailable,
    /// Open ports per live host; hosts without open ports map to an empty list
    Scanned(BTreeMap<IpAddr, Vec<OpenPort>>),
}

impl PortMap {
    /// Open ports of `host`, or `None` when no port information exists
    pub fn ports_for(&self, host: IpAddr) -> Option<Vec<u16>> {
        match self {
            PortMap::Unavailable => None,
            PortMap::Scanned(map) => Some(
                map.get(&host)
                    .map(|ports| ports.iter().map(|p| p.port).collect())
                    .unwrap_or_default(),
            ),
        }
    }

    pub fn open_port_count(&self) -> usize {
        match self {
            PortMap::Unavailable => 0,
            PortMap::Scanned(map) => map.values().map(Vec::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_map_lookup() {
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();

        let mut map = BTreeMap::new();
        map.insert(host, vec![OpenPort::new(22), OpenPort::new(5432)]);
        let ports = PortMap::Scanned(map);

        assert_eq!(ports.ports_for(host), Some(vec![22, 5432]));
        assert_eq!(ports.ports_for(other), Some(vec![]));
        assert_eq!(PortMap::Unavailable.ports_for(host), None);
        assert_eq!(ports.open_port_count(), 2);
    }

    #[test]
    fn test_service_names() {
        assert_eq!(OpenPort::new(22).service.as_deref(), Some("ssh"));
        assert_eq!(OpenPort::new(40000).service, None);
    }
}
