//! Per-stage result artifacts
//!
//! Every stage with a non-empty `format` writes one file into the entry's
//! directory: `host_discovery.<fmt>`, `port_scanning.<fmt>` and
//! `job_<n>_<name>.<fmt>`, with one row per live host, open port or finding.

use crate::discovery::DiscoveryResult;
use crate::error::EngineError;
use crate::jobs::Finding;
use crate::scanner::OpenPort;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Output format options
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// No artifact
    #[default]
    None,
    Csv,
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            OutputFormat::None => None,
            OutputFormat::Csv => Some("csv"),
            OutputFormat::Json => Some("json"),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(OutputFormat::None),
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

#[derive(Debug, Serialize)]
struct HostRow {
    host: IpAddr,
    method: String,
    response_time_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PortRow<'a> {
    host: IpAddr,
    port: u16,
    protocol: &'static str,
    service: Option<&'a str>,
}

/// Findings flattened to scalar columns for CSV
#[derive(Debug, Serialize)]
struct FindingRow<'a> {
    timestamp: String,
    template_id: &'a str,
    template_name: &'a str,
    job: &'a str,
    kind: &'a str,
    severity: &'a str,
    host: IpAddr,
    port: Option<u16>,
    protocol: String,
    matched_at: &'a str,
    evidence: String,
    tags: String,
    reference: String,
    description: &'a str,
    classification: String,
    metadata: String,
}

impl<'a> FindingRow<'a> {
    fn new(finding: &'a Finding) -> Self {
        Self {
            timestamp: finding.timestamp.to_rfc3339(),
            template_id: &finding.template_id,
            template_name: &finding.template_name,
            job: &finding.job,
            kind: &finding.kind,
            severity: &finding.severity,
            host: finding.host,
            port: finding.port,
            protocol: finding.protocol.to_string(),
            matched_at: &finding.matched_at,
            evidence: finding.evidence.join("|"),
            tags: finding.tags.join(","),
            reference: finding.reference.join(" "),
            description: &finding.description,
            classification: serde_json::to_string(&finding.classification).unwrap_or_default(),
            metadata: serde_json::to_string(&finding.metadata).unwrap_or_default(),
        }
    }
}

/// Writes artifacts below one entry directory
#[derive(Debug, Clone)]
pub struct OutputWriter {
    directory: PathBuf,
}

impl OutputWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Create the entry directory
    pub fn prepare(&self) -> crate::Result<()> {
        std::fs::create_dir_all(&self.directory).map_err(|e| {
            EngineError::Setup(format!("cannot create {}: {}", self.directory.display(), e))
        })
    }

    pub fn write_discovery(&self, format: OutputFormat, live: &[DiscoveryResult]) -> crate::Result<Option<PathBuf>> {
        let rows: Vec<HostRow> = live
            .iter()
            .map(|result| HostRow {
                host: result.target,
                method: result.method_used.clone(),
                response_time_ms: result.response_time.map(|rtt| rtt.as_millis() as u64),
            })
            .collect();
        self.write_rows("host_discovery", format, &rows, &rows)
    }

    pub fn write_ports(
        &self,
        format: OutputFormat,
        open_ports: &BTreeMap<IpAddr, Vec<OpenPort>>,
    ) -> crate::Result<Option<PathBuf>> {
        let rows: Vec<PortRow> = open_ports
            .iter()
            .flat_map(|(&host, ports)| {
                ports.iter().map(move |open| PortRow {
                    host,
                    port: open.port,
                    protocol: "tcp",
                    service: open.service.as_deref(),
                })
            })
            .collect();
        self.write_rows("port_scanning", format, &rows, &rows)
    }

    pub fn write_findings(
        &self,
        format: OutputFormat,
        index: usize,
        job: &str,
        findings: &[Finding],
    ) -> crate::Result<Option<PathBuf>> {
        let rows: Vec<FindingRow> = findings.iter().map(FindingRow::new).collect();
        let stem = format!("job_{}_{}", index, file_safe(job));
        self.write_rows(&stem, format, &rows, findings)
    }

    /// CSV gets `rows`; JSON gets `document`, which may keep nested fields
    fn write_rows<R: Serialize, D: Serialize + ?Sized>(
        &self,
        stem: &str,
        format: OutputFormat,
        rows: &[R],
        document: &D,
    ) -> crate::Result<Option<PathBuf>> {
        let extension = match format.extension() {
            Some(extension) => extension,
            None => return Ok(None),
        };
        let path = self.directory.join(format!("{}.{}", stem, extension));
        let output_error = |e: &dyn std::fmt::Display| EngineError::Output(format!("{}: {}", path.display(), e));

        match format {
            OutputFormat::Csv => {
                let mut writer = csv::Writer::from_path(&path).map_err(|e| output_error(&e))?;
                for row in rows {
                    writer.serialize(row).map_err(|e| output_error(&e))?;
                }
                writer.flush().map_err(|e| output_error(&e))?;
            }
            OutputFormat::Json => {
                let file = File::create(&path).map_err(|e| output_error(&e))?;
                let mut writer = BufWriter::new(file);
                serde_json::to_writer_pretty(&mut writer, document).map_err(|e| output_error(&e))?;
                writer.write_all(b"\n").map_err(|e| output_error(&e))?;
                writer.flush().map_err(|e| output_error(&e))?;
            }
            OutputFormat::None => return Ok(None),
        }

        log::debug!("wrote {}", path.display());
        Ok(Some(path))
    }
}

/// Job names end up in file names
fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_format_from_str() {
        assert_eq!("".parse::<OutputFormat>().unwrap(), OutputFormat::None);
        assert_eq!("CSV".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_csv_discovery_rows() {
        let dir = TempDir::new().unwrap();
        let writer = OutputWriter::new(dir.path().join("entry"));
        writer.prepare().unwrap();

        let live = vec![
            DiscoveryResult::new("10.0.0.1".parse().unwrap(), true, "tcp-connect")
                .with_response_time(Duration::from_millis(12)),
            DiscoveryResult::new("10.0.0.2".parse().unwrap(), true, "icmp-echo"),
        ];
        let path = writer.write_discovery(OutputFormat::Csv, &live).unwrap().unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "host,method,response_time_ms");
        assert_eq!(lines[1], "10.0.0.1,tcp-connect,12");
        assert_eq!(lines[2], "10.0.0.2,icmp-echo,");
    }

    #[test]
    fn test_json_ports_and_no_format() {
        let dir = TempDir::new().unwrap();
        let writer = OutputWriter::new(dir.path());
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        let ports = BTreeMap::from([(host, vec![OpenPort::new(22), OpenPort::new(80)])]);

        assert!(writer.write_ports(OutputFormat::None, &ports).unwrap().is_none());

        let path = writer.write_ports(OutputFormat::Json, &ports).unwrap().unwrap();
        assert!(path.ends_with("port_scanning.json"));
        let rows: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);
        assert_eq!(rows[1]["port"], 80);
    }

    #[test]
    fn test_job_file_name() {
        assert_eq!(file_safe("vul scan/1"), "vul_scan_1");
    }
}
