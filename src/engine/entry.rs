//! One runnable scan request

use super::result::{EntryResult, ResultAggregator};
use super::stage::{EntryState, Phase, Stage, StageTracker};
use crate::config::{Options, RunPlan};
use crate::discovery::HostDiscoveryEngine;
use crate::error::EngineError;
use crate::jobs::JobEngine;
use crate::output::OutputWriter;
use crate::scanner::{PortMap, PortScanEngine};
use crate::templates::{RawTemplate, TemplateCache};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// A configured scan: options, resolved targets, progress and result.
///
/// Share it behind an `Arc` to observe or stop it while `run` is pending.
#[derive(Debug)]
pub struct Entry {
    id: String,
    options: Options,
    plan: RunPlan,
    targets: Vec<IpAddr>,
    directory: PathBuf,
    cancel: CancellationToken,
    started: AtomicBool,
    tracker: StageTracker,
    results: ResultAggregator,
}

impl Entry {
    pub(crate) fn new(
        directory: PathBuf,
        id: String,
        options: Options,
        plan: RunPlan,
        targets: Vec<IpAddr>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tracker: StageTracker::new(&id),
            results: ResultAggregator::new(&id, targets.len()),
            id,
            options,
            plan,
            targets,
            directory,
            cancel,
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Resolved targets, ascending and without exclusions
    pub fn targets(&self) -> &[IpAddr] {
        &self.targets
    }

    /// Directory that receives this entry's artifacts
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Progress snapshot; valid before, during and after `run`
    pub fn stage(&self) -> Stage {
        self.tracker.snapshot()
    }

    /// Result snapshot, partial while the entry is running
    pub fn result(&self) -> EntryResult {
        self.results.snapshot()
    }

    /// Request early termination. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            log::info!("entry {}: stop requested", self.id);
        }
        self.cancel.cancel();
    }

    /// Drive the pipeline to a terminal state.
    ///
    /// `ctx` is linked to the entry's own token, so cancelling it has the
    /// same effect as [`Entry::stop`]. A stopped run returns
    /// [`EngineError::Stopped`]; the partial result stays available.
    pub async fn run(&self, ctx: CancellationToken) -> crate::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        if ctx.is_cancelled() {
            self.cancel.cancel();
        }
        let link = {
            let entry_cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = ctx.cancelled() => entry_cancel.cancel(),
                    _ = entry_cancel.cancelled() => {}
                }
            })
        };

        let writer = OutputWriter::new(&self.directory);
        let outcome = match self.setup(&writer).await {
            Ok(templates) => {
                self.tracker.start();
                self.results.mark_started();
                log::info!("entry {}: running against {} targets", self.id, self.targets.len());
                self.pipeline(&writer, templates).await
            }
            Err(e) => {
                log::error!("entry {}: setup failed: {}", self.id, e);
                Err(e)
            }
        };
        link.abort();

        let state = match &outcome {
            Ok(()) => EntryState::Completed,
            Err(EngineError::Stopped) => EntryState::Stopped,
            Err(_) => EntryState::Failed,
        };
        self.tracker.finish(state);
        self.results.mark_finished(state);

        let stage = self.tracker.snapshot();
        log::info!(
            "entry {}: {} ({} live hosts, {} open ports, {} findings, {} errors)",
            self.id,
            state,
            stage.live_hosts,
            stage.open_ports,
            stage.findings,
            stage.errors
        );
        outcome
    }

    /// Prepare the entry directory and load every job's templates once
    async fn setup(&self, writer: &OutputWriter) -> crate::Result<Vec<Vec<RawTemplate>>> {
        writer.prepare()?;

        let mut loaded = Vec::with_capacity(self.plan.jobs.len());
        for job in &self.plan.jobs {
            let source = job.source.clone();
            let templates = tokio::task::spawn_blocking(move || source.load())
                .await
                .map_err(|e| EngineError::Setup(format!("template loader panicked: {}", e)))?
                .map_err(|reason| EngineError::TemplateSource {
                    job: job.name.clone(),
                    reason,
                })?;
            log::info!("job '{}': {} templates from {}", job.name, templates.len(), job.source.describe());
            loaded.push(templates);
        }

        for (job, templates) in self.plan.jobs.iter().zip(&loaded) {
            self.results.begin_job(job.index, &job.name, &job.kind);
            self.results.set_job_templates(job.index, templates.len());
        }
        Ok(loaded)
    }

    async fn pipeline(&self, writer: &OutputWriter, templates: Vec<Vec<RawTemplate>>) -> crate::Result<()> {
        let plan = &self.plan;

        self.checkpoint()?;
        self.tracker.enter_phase(Phase::HostDiscovery, self.targets.len());
        let live = HostDiscoveryEngine::new(&plan.discovery)
            .run(&self.targets, &self.tracker, &self.cancel)
            .await?;
        let hosts: Vec<IpAddr> = live.iter().map(|result| result.target).collect();
        self.results.set_live_hosts(hosts.clone());
        self.tracker.set_live_hosts(hosts.len());
        if plan.discovery.settings.enabled {
            self.persist(writer.write_discovery(plan.discovery.settings.format, &live));
        }

        self.checkpoint()?;
        let ports = if plan.port_scan.settings.enabled {
            let engine = PortScanEngine::new(&plan.port_scan);
            self.tracker
                .enter_phase(Phase::PortScanning, hosts.len() * engine.ports().len());
            let ports = engine.run(&hosts, &self.tracker, &self.results, &self.cancel).await?;
            if let PortMap::Scanned(map) = &ports {
                self.persist(writer.write_ports(plan.port_scan.settings.format, map));
            }
            ports
        } else {
            log::info!("entry {}: port scanning disabled", self.id);
            self.tracker.enter_phase(Phase::PortScanning, 0);
            PortMap::Unavailable
        };

        self.checkpoint()?;
        self.tracker.enter_phase(Phase::Jobs, plan.jobs.len());
        let cache = TemplateCache::new();
        for (job, templates) in plan.jobs.iter().zip(&templates) {
            self.checkpoint()?;
            let findings = JobEngine::new(job.clone())
                .run(templates, &hosts, &ports, &cache, &self.tracker, &self.results, &self.cancel)
                .await?;
            self.persist(writer.write_findings(job.settings.format, job.index, &job.name, &findings));
        }

        self.checkpoint()
    }

    /// Stage boundary: a cancelled entry goes no further
    fn checkpoint(&self) -> crate::Result<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Artifact failures are warnings; the scan data is still in the result
    fn persist(&self, written: crate::Result<Option<PathBuf>>) {
        match written {
            Ok(Some(path)) => log::info!("entry {}: wrote {}", self.id, path.display()),
            Ok(None) => {}
            Err(e) => {
                log::warn!("entry {}: {}", self.id, e);
                self.tracker.record_warning();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, HostDiscoveryOptions, JobOptions, PortScanningOptions};
    use crate::engine::Engine;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn quiet_options() -> Options {
        Options::new(["127.0.0.1"])
            .with_host_discovery(HostDiscoveryOptions::disabled())
            .with_port_scanning(PortScanningOptions::disabled())
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::default().with_directory(dir.path())).unwrap();
        let entry = engine.new_entry(quiet_options()).unwrap();

        entry.run(CancellationToken::new()).await.unwrap();
        assert_eq!(entry.stage().state, EntryState::Completed);
        assert_eq!(entry.stage().phase, Phase::Finished);
        assert!(matches!(entry.run(CancellationToken::new()).await, Err(EngineError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_missing_template_directory_fails_setup() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::default().with_directory(dir.path())).unwrap();
        let options = quiet_options()
            .with_job(JobOptions::new("vul", "vul-scan").with_template_dir(dir.path().join("missing")));
        let entry = engine.new_entry(options).unwrap();

        let err = entry.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::TemplateSource { .. }));
        let stage = entry.stage();
        assert_eq!(stage.state, EntryState::Failed);
        assert_eq!(stage.phase, Phase::Pending);
        // never reported as running
        assert!(stage.started_at.is_none());
        assert!(entry.result().started_at.is_none());
    }

    #[tokio::test]
    async fn test_stop_before_run() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::default().with_directory(dir.path())).unwrap();
        let entry = Arc::new(engine.new_entry(quiet_options()).unwrap());

        entry.stop();
        entry.stop();
        let err = entry.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Stopped));
        assert_eq!(entry.result().state, EntryState::Stopped);
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_entry() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::default().with_directory(dir.path())).unwrap();
        let entry = engine.new_entry(quiet_options()).unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(entry.run(ctx).await, Err(EngineError::Stopped)));
        assert_eq!(entry.stage().state, EntryState::Stopped);
    }
}
