//! Engine and entry lifecycle
//!
//! An [`Engine`] owns the results directory and issues [`Entry`] values.
//! Each entry runs its pipeline once: host discovery, port scanning, then
//! the configured jobs in order.

pub mod entry;
pub mod result;
pub mod stage;

use crate::config::{EngineConfig, Options};
use crate::error::EngineError;
use crate::utils::resolve_targets;
use crate::utils::target_parser::TargetParser;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use entry::Entry;
pub use result::{EntryResult, JobSummary, ResultAggregator};
pub use stage::{CurrentJob, EntryState, Phase, Stage, StageTracker};

/// Factory for entries sharing one results directory
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    parser: TargetParser,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Engine {
    /// Create the engine, preparing its results directory
    pub fn new(config: EngineConfig) -> crate::Result<Self> {
        std::fs::create_dir_all(&config.directory).map_err(|e| {
            EngineError::Setup(format!("cannot prepare {}: {}", config.directory.display(), e))
        })?;
        log::info!("results directory: {}", config.directory.display());

        Ok(Self {
            parser: TargetParser::new(config.max_addresses),
            config,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Validate `options`, resolve its targets and create an entry.
    ///
    /// Every error here is a configuration error; nothing has run yet.
    pub fn new_entry(&self, options: Options) -> crate::Result<Entry> {
        if self.is_closed() {
            return Err(EngineError::EngineClosed);
        }

        let plan = options.validate()?;
        let targets = resolve_targets(&options.targets, &options.exclude_targets, &self.parser)?;
        let id = Uuid::new_v4().to_string();
        log::info!("entry {}: {} targets, {} jobs", id, targets.len(), plan.jobs.len());

        Ok(Entry::new(
            self.config.directory.join(&id),
            id,
            options,
            plan,
            targets,
            self.cancel.child_token(),
        ))
    }

    /// Cancel every entry issued so far and refuse new ones
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::info!("closing engine");
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> Options {
        Options::new(["10.0.0.1-3"])
    }

    #[test]
    fn test_new_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/results");
        let engine = Engine::new(EngineConfig::default().with_directory(&path)).unwrap();
        assert!(path.is_dir());
        assert_eq!(engine.directory(), path.as_path());
    }

    #[test]
    fn test_new_fails_on_file_path() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        let err = Engine::new(EngineConfig::default().with_directory(&file)).unwrap_err();
        assert!(matches!(err, EngineError::Setup(_)));
    }

    #[test]
    fn test_configuration_errors_fail_entry_creation() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::default().with_directory(dir.path())).unwrap();

        let err = engine.new_entry(Options::new(["not-a-target"])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTargetSpec(_)));

        let err = engine
            .new_entry(Options::new(["10.0.0.1"]).with_excludes(["10.0.0.1"]))
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyTargetSet));
    }

    #[test]
    fn test_close_refuses_new_entries() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::default().with_directory(dir.path())).unwrap();

        let entry = engine.new_entry(options()).unwrap();
        assert_eq!(entry.targets().len(), 3);

        engine.close();
        assert!(matches!(engine.new_entry(options()), Err(EngineError::EngineClosed)));
    }
}
