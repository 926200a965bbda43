//! Discovery methods: TCP connect and ICMP echo

use super::{DiscoveryMethod, DiscoveryResult};
use crate::error::{is_resource_exhaustion, EngineError};
use crate::network::icmp::IcmpPinger;
use crate::network::socket::TcpConnectScanner;
use crate::network::PortState;
use futures::stream::{FuturesUnordered, StreamExt};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// TCP connect discovery.
///
/// Any answer proves the host is up, including a refused connection. The
/// probe ports are raced, so one attempt lasts at most one connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDiscovery {
    ports: Vec<u16>,
    scanner: TcpConnectScanner,
}

impl TcpDiscovery {
    pub fn new(ports: Vec<u16>, timeout: Duration) -> Self {
        Self {
            ports,
            scanner: TcpConnectScanner::new(timeout),
        }
    }
}

#[async_trait::async_trait]
impl DiscoveryMethod for TcpDiscovery {
    async fn discover(&self, target: IpAddr) -> crate::Result<DiscoveryResult> {
        let start_time = Instant::now();
        let scanner = &self.scanner;
        let mut probes: FuturesUnordered<_> = self
            .ports
            .iter()
            .map(|&port| async move { (port, scanner.scan_port(target, port).await) })
            .collect();

        while let Some((port, state)) = probes.next().await {
            match state {
                Ok(PortState::Open) | Ok(PortState::Closed) => {
                    return Ok(DiscoveryResult::new(target, true, self.method_name())
                        .with_response_time(start_time.elapsed()));
                }
                Ok(PortState::Filtered) => {}
                Err(e @ EngineError::ResourceExhausted(_)) => return Err(e),
                Err(e) => log::debug!("tcp probe {}:{} failed: {}", target, port, e),
            }
        }

        Ok(DiscoveryResult::new(target, false, self.method_name()))
    }

    fn method_name(&self) -> &str {
        "tcp-connect"
    }
}

/// ICMP echo discovery through the system `ping`
#[derive(Debug, Clone)]
pub struct IcmpDiscovery {
    pinger: IcmpPinger,
}

impl IcmpDiscovery {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pinger: IcmpPinger::new(timeout),
        }
    }
}

#[async_trait::async_trait]
impl DiscoveryMethod for IcmpDiscovery {
    async fn discover(&self, target: IpAddr) -> crate::Result<DiscoveryResult> {
        match self.pinger.ping(target).await {
            Ok(ping) => Ok(DiscoveryResult::new(target, ping.success, self.method_name())
                .with_response_time(ping.rtt)),
            Err(e) if is_resource_exhaustion(&e) => {
                Err(EngineError::ResourceExhausted(format!("ping {}: {}", target, e)))
            }
            Err(e) => Err(EngineError::Network(format!("ping {}: {}", target, e))),
        }
    }

    fn method_name(&self) -> &str {
        "icmp-echo"
    }
}
