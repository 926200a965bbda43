//! Result aggregation
//!
//! Everything is appended under one mutex and snapshots clone under the same
//! lock, so a partial result read during a run is always self-consistent.

use crate::engine::stage::EntryState;
use crate::jobs::Finding;
use crate::scanner::OpenPort;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

/// Per-job counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSummary {
    pub index: usize,
    pub name: String,
    pub kind: String,
    /// Raw templates the source produced
    pub templates: usize,
    /// Template requests that ran to completion
    pub executed: u64,
    /// Requests that failed after all retries
    pub errors: u64,
    /// Skipped templates and blocks, with the reason
    pub warnings: Vec<String>,
    pub findings: usize,
}

/// Consumer-visible output of an entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryResult {
    pub entry_id: String,
    pub state: EntryState,
    pub target_count: usize,
    pub live_hosts: Vec<IpAddr>,
    pub open_ports: BTreeMap<IpAddr, Vec<OpenPort>>,
    pub jobs: Vec<JobSummary>,
    pub findings: Vec<Finding>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EntryResult {
    fn new(entry_id: &str, target_count: usize) -> Self {
        Self {
            entry_id: entry_id.to_string(),
            state: EntryState::Created,
            target_count,
            live_hosts: Vec::new(),
            open_ports: BTreeMap::new(),
            jobs: Vec::new(),
            findings: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn open_port_count(&self) -> usize {
        self.open_ports.values().map(Vec::len).sum()
    }

    pub fn job(&self, index: usize) -> Option<&JobSummary> {
        self.jobs.iter().find(|job| job.index == index)
    }
}

/// Append-only accumulator behind [`EntryResult`]
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    inner: Arc<Mutex<EntryResult>>,
}

impl ResultAggregator {
    pub fn new(entry_id: &str, target_count: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EntryResult::new(entry_id, target_count))),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut EntryResult) -> R) -> R {
        let mut result = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut result)
    }

    pub fn snapshot(&self) -> EntryResult {
        self.with(|result| result.clone())
    }

    pub fn mark_started(&self) {
        self.with(|result| {
            result.state = EntryState::Running;
            result.started_at = Some(Utc::now());
        });
    }

    pub fn mark_finished(&self, state: EntryState) {
        self.with(|result| {
            result.state = state;
            result.finished_at = Some(Utc::now());
        });
    }

    pub fn set_live_hosts(&self, hosts: Vec<IpAddr>) {
        self.with(|result| result.live_hosts = hosts);
    }

    pub fn add_open_port(&self, host: IpAddr, port: OpenPort) {
        self.with(|result| {
            let ports = result.open_ports.entry(host).or_default();
            if let Err(pos) = ports.binary_search_by_key(&port.port, |p| p.port) {
                ports.insert(pos, port);
            }
        });
    }

    pub fn begin_job(&self, index: usize, name: &str, kind: &str) {
        self.with(|result| {
            result.jobs.push(JobSummary {
                index,
                name: name.to_string(),
                kind: kind.to_string(),
                ..Default::default()
            })
        });
    }

    fn with_job(&self, index: usize, f: impl FnOnce(&mut JobSummary)) {
        self.with(|result| {
            if let Some(job) = result.jobs.iter_mut().find(|job| job.index == index) {
                f(job);
            }
        });
    }

    pub fn set_job_templates(&self, index: usize, templates: usize) {
        self.with_job(index, |job| job.templates = templates);
    }

    pub fn job_executed(&self, index: usize) {
        self.with_job(index, |job| job.executed += 1);
    }

    pub fn job_error(&self, index: usize) {
        self.with_job(index, |job| job.errors += 1);
    }

    pub fn job_warning(&self, index: usize, warning: String) {
        self.with_job(index, |job| job.warnings.push(warning));
    }

    pub fn add_finding(&self, index: usize, finding: Finding) {
        self.with(|result| {
            if let Some(job) = result.jobs.iter_mut().find(|job| job.index == index) {
                job.findings += 1;
            }
            result.findings.push(finding);
        });
    }
}
