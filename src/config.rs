//! Configuration for engine runs
//!
//! `Options` is the caller-facing snapshot. Durations, port specs and output
//! tags stay as strings so the struct deserializes straight from TOML or YAML;
//! [`Options::validate`] turns them into a [`RunPlan`] once, when an entry is
//! created.

use crate::discovery::DiscoveryKind;
use crate::error::EngineError;
use crate::output::OutputFormat;
use crate::scanner::ports::PortSpec;
use crate::templates::loader::{DirectorySource, FnSource, TemplateSource};
use crate::templates::RawTemplate;
use crate::utils::target_parser::DEFAULT_MAX_ADDRESSES;
use crate::utils::timing::parse_duration_or;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Timeout used when a stage leaves `timeout` empty
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Concurrency used when a stage leaves `concurrency` at zero
pub const DEFAULT_CONCURRENCY: usize = 100;

/// Base delay between retries of one probe or request
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Probe ports for TCP host discovery when none are configured
pub const DEFAULT_DISCOVERY_PORTS: &str = "80,443,22,21,25,135,139,445,3389,8080";

/// Lazily produces raw templates for a job
pub type TemplateProducer = Arc<dyn Fn() -> Vec<RawTemplate> + Send + Sync>;

/// Host discovery stage options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostDiscoveryOptions {
    /// Run the stage; when false every resolved target is treated as live
    #[serde(rename = "use", alias = "enabled")]
    pub enabled: bool,

    /// Per-probe timeout, a duration literal such as `"5s"`
    pub timeout: String,

    /// Extra attempts before a host is declared down
    pub count: u32,

    /// Output artifact format (`csv`, `json` or empty)
    pub format: String,

    /// Probes admitted per second, 0 for unlimited
    pub rate_limit: u32,

    /// Probes in flight at once, 0 for the default
    pub concurrency: usize,

    /// Probe methods tried in order
    pub methods: Vec<String>,

    /// TCP probe ports
    pub ports: String,
}

impl Default for HostDiscoveryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: "5s".to_string(),
            count: 1,
            format: String::new(),
            rate_limit: 0,
            concurrency: 0,
            methods: vec!["tcp".to_string(), "icmp".to_string()],
            ports: DEFAULT_DISCOVERY_PORTS.to_string(),
        }
    }
}

impl HostDiscoveryOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = timeout.into();
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: u32) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_methods<S: Into<String>>(mut self, methods: impl IntoIterator<Item = S>) -> Self {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ports(mut self, ports: impl Into<String>) -> Self {
        self.ports = ports.into();
        self
    }
}

/// Port scan stage options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortScanningOptions {
    #[serde(rename = "use", alias = "enabled")]
    pub enabled: bool,
    pub timeout: String,
    pub count: u32,
    pub format: String,
    pub rate_limit: u32,
    pub concurrency: usize,

    /// Port spec: numbers, ranges, service aliases or `top100`/`top1000`/`all`
    pub ports: String,
}

impl Default for PortScanningOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: "5s".to_string(),
            count: 1,
            format: String::new(),
            rate_limit: 0,
            concurrency: 0,
            ports: "top100".to_string(),
        }
    }
}

impl PortScanningOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = timeout.into();
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: u32) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_ports(mut self, ports: impl Into<String>) -> Self {
        self.ports = ports.into();
        self
    }
}

/// One job: a named bundle of templates with its own budgets
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub name: String,

    /// Free-form label carried into findings (`vul-scan`, `asset-scan`, ...)
    pub kind: String,

    /// Template directory, loaded recursively
    pub template: Option<PathBuf>,

    /// In-memory template producer; mutually exclusive with `template`
    #[serde(skip)]
    pub get_templates: Option<TemplateProducer>,

    pub format: String,
    pub count: u32,
    pub timeout: String,
    pub rate_limit: u32,
    pub concurrency: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: String::new(),
            template: None,
            get_templates: None,
            format: String::new(),
            count: 1,
            timeout: "5s".to_string(),
            rate_limit: 0,
            concurrency: 0,
        }
    }
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("template", &self.template)
            .field("get_templates", &self.get_templates.as_ref().map(|_| "<fn>"))
            .field("format", &self.format)
            .field("count", &self.count)
            .field("timeout", &self.timeout)
            .field("rate_limit", &self.rate_limit)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl JobOptions {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Load templates from a directory
    pub fn with_template_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.template = Some(path.into());
        self
    }

    /// Produce templates from a closure
    pub fn with_templates<F>(mut self, producer: F) -> Self
    where
        F: Fn() -> Vec<RawTemplate> + Send + Sync + 'static,
    {
        self.get_templates = Some(Arc::new(producer));
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = timeout.into();
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: u32) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Configuration snapshot for one entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub targets: Vec<String>,
    pub exclude_targets: Vec<String>,
    pub host_discovery: HostDiscoveryOptions,
    pub port_scanning: PortScanningOptions,
    pub jobs: Vec<JobOptions>,
}

impl Options {
    pub fn new<S: Into<String>>(targets: impl IntoIterator<Item = S>) -> Self {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_excludes<S: Into<String>>(mut self, excludes: impl IntoIterator<Item = S>) -> Self {
        self.exclude_targets = excludes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_host_discovery(mut self, options: HostDiscoveryOptions) -> Self {
        self.host_discovery = options;
        self
    }

    pub fn with_port_scanning(mut self, options: PortScanningOptions) -> Self {
        self.port_scanning = options;
        self
    }

    pub fn with_job(mut self, job: JobOptions) -> Self {
        self.jobs.push(job);
        self
    }

    /// Load options from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::invalid_option("config", format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| EngineError::invalid_option("config", format!("failed to parse TOML: {}", e)))
    }

    pub fn from_yaml_str(content: &str) -> crate::Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| EngineError::invalid_option("config", format!("failed to parse YAML: {}", e)))
    }

    /// Validate the options and resolve every string setting.
    ///
    /// Target resolution is not part of the plan; the engine does it with its
    /// own expansion cap.
    pub fn validate(&self) -> crate::Result<RunPlan> {
        let discovery = DiscoveryPlan {
            settings: StageSettings::resolve(
                "host_discovery",
                self.host_discovery.enabled,
                &self.host_discovery.timeout,
                self.host_discovery.count,
                &self.host_discovery.format,
                self.host_discovery.rate_limit,
                self.host_discovery.concurrency,
            )?,
            methods: self
                .host_discovery
                .methods
                .iter()
                .map(|m| {
                    m.parse::<DiscoveryKind>()
                        .map_err(|e| EngineError::invalid_option("host_discovery.methods", e))
                })
                .collect::<crate::Result<Vec<_>>>()?,
            probe_ports: parse_ports("host_discovery.ports", &self.host_discovery.ports, DEFAULT_DISCOVERY_PORTS)?,
        };
        if discovery.settings.enabled && discovery.methods.is_empty() {
            return Err(EngineError::invalid_option(
                "host_discovery.methods",
                "at least one method is required",
            ));
        }

        let port_scan = PortScanPlan {
            settings: StageSettings::resolve(
                "port_scanning",
                self.port_scanning.enabled,
                &self.port_scanning.timeout,
                self.port_scanning.count,
                &self.port_scanning.format,
                self.port_scanning.rate_limit,
                self.port_scanning.concurrency,
            )?,
            ports: parse_ports("port_scanning.ports", &self.port_scanning.ports, "top100")?,
        };

        let jobs = self
            .jobs
            .iter()
            .enumerate()
            .map(|(index, job)| JobPlan::resolve(index, job))
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(RunPlan {
            discovery,
            port_scan,
            jobs,
        })
    }
}

fn parse_ports(field: &str, spec: &str, fallback: &str) -> crate::Result<Vec<u16>> {
    let spec = if spec.trim().is_empty() { fallback } else { spec };
    PortSpec::parse(spec)
        .map(PortSpec::into_ports)
        .map_err(|e| EngineError::invalid_option(field, e))
}

/// Budgets and switches of one stage after validation
#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    pub enabled: bool,
    pub timeout: Duration,
    pub retries: u32,
    pub format: OutputFormat,
    pub rate_limit: u32,
    pub concurrency: usize,
}

impl StageSettings {
    fn resolve(
        stage: &str,
        enabled: bool,
        timeout: &str,
        count: u32,
        format: &str,
        rate_limit: u32,
        concurrency: usize,
    ) -> crate::Result<Self> {
        let timeout = parse_duration_or(timeout, DEFAULT_TIMEOUT)
            .map_err(|e| EngineError::invalid_option(format!("{}.timeout", stage), e))?;
        if timeout.is_zero() {
            return Err(EngineError::invalid_option(
                format!("{}.timeout", stage),
                "timeout must be greater than zero",
            ));
        }
        let format = format
            .parse::<OutputFormat>()
            .map_err(|e| EngineError::invalid_option(format!("{}.format", stage), e))?;

        Ok(Self {
            enabled,
            timeout,
            retries: count,
            format,
            rate_limit,
            concurrency: if concurrency == 0 { DEFAULT_CONCURRENCY } else { concurrency },
        })
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryPlan {
    pub settings: StageSettings,
    pub methods: Vec<DiscoveryKind>,
    pub probe_ports: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct PortScanPlan {
    pub settings: StageSettings,
    pub ports: Vec<u16>,
}

/// A job after validation, with its template source chosen
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub index: usize,
    pub name: String,
    pub kind: String,
    pub source: Arc<dyn TemplateSource>,
    pub settings: StageSettings,
}

impl JobPlan {
    fn resolve(index: usize, job: &JobOptions) -> crate::Result<Self> {
        let field = |name: &str| format!("jobs[{}].{}", index, name);

        if job.name.trim().is_empty() {
            return Err(EngineError::invalid_option(field("name"), "job name cannot be empty"));
        }

        let source: Arc<dyn TemplateSource> = match (&job.template, &job.get_templates) {
            (Some(path), None) => Arc::new(DirectorySource::new(path.clone())),
            (None, Some(producer)) => Arc::new(FnSource::new(producer.clone())),
            (Some(_), Some(_)) => {
                return Err(EngineError::invalid_option(
                    field("template"),
                    "set either a template directory or a template producer, not both",
                ))
            }
            (None, None) => {
                return Err(EngineError::invalid_option(field("template"), "no template source"))
            }
        };

        let settings = StageSettings::resolve(
            &format!("jobs[{}]", index),
            true,
            &job.timeout,
            job.count,
            &job.format,
            job.rate_limit,
            job.concurrency,
        )?;

        Ok(Self {
            index,
            name: job.name.clone(),
            kind: job.kind.clone(),
            source,
            settings,
        })
    }
}

/// Everything a run needs, resolved from [`Options`]
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub discovery: DiscoveryPlan,
    pub port_scan: PortScanPlan,
    pub jobs: Vec<JobPlan>,
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Results directory; one subdirectory per entry
    pub directory: PathBuf,

    /// Cap on how many addresses a single target spec may expand to
    pub max_addresses: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./results"),
            max_addresses: DEFAULT_MAX_ADDRESSES,
        }
    }
}

impl EngineConfig {
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_max_addresses(mut self, max_addresses: u64) -> Self {
        self.max_addresses = max_addresses;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pgsql_job() -> JobOptions {
        JobOptions::new("asset", "asset-scan").with_templates(Vec::new)
    }

    #[test]
    fn test_defaults_validate() {
        let plan = Options::new(["10.0.0.1"]).with_job(pgsql_job()).validate().unwrap();

        assert_eq!(plan.discovery.settings.timeout, Duration::from_secs(5));
        assert_eq!(plan.discovery.methods, vec![DiscoveryKind::Tcp, DiscoveryKind::Icmp]);
        assert_eq!(plan.port_scan.settings.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(plan.port_scan.ports.len(), 100);
        assert_eq!(plan.jobs.len(), 1);
        assert_eq!(plan.jobs[0].settings.format, OutputFormat::None);
    }

    #[test]
    fn test_bad_timeout_is_configuration_error() {
        let options = Options::new(["10.0.0.1"])
            .with_port_scanning(PortScanningOptions::default().with_timeout("soon"));
        let err = options.validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidOption { ref field, .. } if field == "port_scanning.timeout"));
        assert_eq!(err.class(), crate::error::ErrorClass::Configuration);
    }

    #[test]
    fn test_empty_timeout_uses_default() {
        let options = Options::new(["10.0.0.1"])
            .with_host_discovery(HostDiscoveryOptions::default().with_timeout(""));
        let plan = options.validate().unwrap();
        assert_eq!(plan.discovery.settings.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_bad_ports_and_format() {
        let options = Options::new(["10.0.0.1"])
            .with_port_scanning(PortScanningOptions::default().with_ports("gopher-plus"));
        assert!(options.validate().is_err());

        let options = Options::new(["10.0.0.1"])
            .with_port_scanning(PortScanningOptions::default().with_format("xml"));
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_job_needs_exactly_one_source() {
        let neither = Options::new(["10.0.0.1"]).with_job(JobOptions::new("j", "vul-scan"));
        assert!(neither.validate().is_err());

        let both = Options::new(["10.0.0.1"])
            .with_job(JobOptions::new("j", "vul-scan").with_template_dir("/tmp").with_templates(Vec::new));
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_from_toml_str() {
        let options = Options::from_toml_str(
            r#"
            targets = ["192.168.1.0-192.168.1.255"]
            exclude_targets = ["192.168.1.108"]

            [host_discovery]
            use = true
            timeout = "2s"
            count = 2
            format = "csv"
            rate_limit = 1000
            concurrency = 1000

            [port_scanning]
            use = false
            ports = "http"

            [[jobs]]
            name = "vul"
            kind = "vul-scan"
            template = "./templates"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(options.targets.len(), 1);
        assert!(!options.port_scanning.enabled);
        assert_eq!(options.host_discovery.count, 2);
        assert_eq!(options.jobs[0].template, Some(PathBuf::from("./templates")));

        let plan = options.validate().unwrap();
        assert_eq!(plan.discovery.settings.format, OutputFormat::Csv);
        assert_eq!(plan.port_scan.ports, vec![80]);
    }

    #[test]
    fn test_from_yaml_str() {
        let options = Options::from_yaml_str(
            "targets: [\"10.0.0.1\"]\nhost_discovery:\n  use: false\n",
        )
        .unwrap();
        assert!(!options.host_discovery.enabled);
        assert!(options.port_scanning.enabled);
    }
}
