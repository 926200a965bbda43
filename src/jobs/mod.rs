//! Template-driven job stage
//!
//! A job runs every template from its source against the hosts that survived
//! discovery. Each template block is expanded into (host, port) targets,
//! executed through the job's own worker pool, and evaluated with the
//! block's matchers. Hits become [`Finding`]s.

pub mod engine;
pub mod executor;

use crate::network::Protocol;
use crate::templates::{ParsedTemplate, TemplateInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub use engine::JobEngine;
pub use executor::{Exchange, HttpExecutor, TcpExecutor};

/// One (host, port) a template block runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobTarget {
    pub host: IpAddr,
    pub port: u16,
}

impl JobTarget {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Host as it appears in a URL authority
    pub fn url_host(&self) -> String {
        match self.host {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        }
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.url_host(), self.port)
    }

    pub fn scheme(&self) -> &'static str {
        match self.port {
            443 | 8443 => "https",
            _ => "http",
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.host_port())
    }

    /// Expand `{{BaseURL}}`, `{{RootURL}}`, `{{Hostname}}`, `{{Host}}` and `{{Port}}`
    pub fn substitute(&self, text: &str) -> String {
        if !text.contains("{{") {
            return text.to_string();
        }
        let base = self.base_url();
        text.replace("{{BaseURL}}", &base)
            .replace("{{RootURL}}", &base)
            .replace("{{Hostname}}", &self.host_port())
            .replace("{{Host}}", &self.url_host())
            .replace("{{Port}}", &self.port.to_string())
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host_port())
    }
}

/// A template hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub template_id: String,
    pub template_name: String,
    pub job: String,
    pub kind: String,
    pub host: IpAddr,
    pub port: Option<u16>,
    pub protocol: Protocol,
    /// Address or URL that produced the hit
    pub matched_at: String,
    pub evidence: Vec<String>,
    pub severity: String,
    pub tags: Vec<String>,
    pub reference: Vec<String>,
    pub description: String,
    pub classification: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Finding {
    pub fn new(
        template: &ParsedTemplate,
        job: &str,
        kind: &str,
        target: JobTarget,
        protocol: Protocol,
        matched_at: String,
        evidence: Vec<String>,
    ) -> Self {
        let TemplateInfo {
            name,
            severity,
            description,
            reference,
            classification,
            metadata,
            tags,
            ..
        } = template.info.clone();

        Self {
            template_id: template.id.clone(),
            template_name: name,
            job: job.to_string(),
            kind: kind.to_string(),
            host: target.host,
            port: Some(target.port),
            protocol,
            matched_at,
            evidence,
            severity,
            tags,
            reference,
            description,
            classification,
            metadata,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_v4() {
        let target = JobTarget::new("10.0.0.5".parse().unwrap(), 8443);
        assert_eq!(target.substitute("{{BaseURL}}/login"), "https://10.0.0.5:8443/login");
        assert_eq!(target.substitute("Host: {{Hostname}}"), "Host: 10.0.0.5:8443");
        assert_eq!(target.substitute("{{Host}}|{{Port}}"), "10.0.0.5|8443");
    }

    #[test]
    fn test_placeholders_v6_are_bracketed() {
        let target = JobTarget::new("::1".parse().unwrap(), 80);
        assert_eq!(target.base_url(), "http://[::1]:80");
        assert_eq!(target.to_string(), "[::1]:80");
    }
}
