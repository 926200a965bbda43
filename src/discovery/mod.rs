//! Host discovery stage
//!
//! Each target is probed with the configured methods in order until one of
//! them proves the host is up. A whole round of methods is one attempt; a
//! host is declared down after `count + 1` failed attempts.

pub mod engine;
pub mod methods;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

pub use engine::HostDiscoveryEngine;
pub use methods::{IcmpDiscovery, TcpDiscovery};

/// Discovery result for a single host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub target: IpAddr,
    pub is_alive: bool,
    pub response_time: Option<Duration>,
    pub method_used: String,
}

impl DiscoveryResult {
    pub fn new(target: IpAddr, is_alive: bool, method: &str) -> Self {
        Self {
            target,
            is_alive,
            response_time: None,
            method_used: method.to_string(),
        }
    }

    pub fn with_response_time(mut self, response_time: Duration) -> Self {
        self.response_time = Some(response_time);
        self
    }
}

/// Discovery method trait
#[async_trait::async_trait]
pub trait DiscoveryMethod: Send + Sync {
    /// Probe `target` once.
    ///
    /// `Ok` with `is_alive == false` means the host did not answer this
    /// method; errors are reserved for probes that could not be carried out.
    async fn discover(&self, target: IpAddr) -> crate::Result<DiscoveryResult>;

    fn method_name(&self) -> &str;
}

/// Configurable discovery methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    Tcp,
    Icmp,
}

impl FromStr for DiscoveryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" | "tcp-connect" => Ok(DiscoveryKind::Tcp),
            "icmp" | "ping" | "icmp-echo" => Ok(DiscoveryKind::Icmp),
            other => Err(format!("unknown discovery method: {}", other)),
        }
    }
}
