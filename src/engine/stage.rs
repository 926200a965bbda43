//! Observable run progress
//!
//! The driver mutates the [`Stage`] only through [`StageTracker`]; observers
//! get clones taken under the read lock, so a snapshot is never torn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

/// Lifecycle state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Created,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Completed | EntryState::Stopped | EntryState::Failed)
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntryState::Created => "created",
            EntryState::Running => "running",
            EntryState::Completed => "completed",
            EntryState::Stopped => "stopped",
            EntryState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Pipeline phase; the ordering is the order phases run in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    HostDiscovery,
    PortScanning,
    Jobs,
    Finished,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Pending => "pending",
            Phase::HostDiscovery => "host discovery",
            Phase::PortScanning => "port scanning",
            Phase::Jobs => "jobs",
            Phase::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Job currently executing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentJob {
    pub index: usize,
    pub name: String,
}

/// Progress snapshot of one entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub entry_id: String,
    pub state: EntryState,
    pub phase: Phase,
    pub current_job: Option<CurrentJob>,

    /// Units finished in the current phase (or job)
    pub done: usize,
    /// Units scheduled in the current phase (or job)
    pub total: usize,
    /// Units finished since the run started, across phases
    pub completed: u64,

    pub live_hosts: usize,
    pub open_ports: usize,
    pub findings: usize,
    pub errors: u64,
    pub warnings: u64,

    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Stage {
    fn new(entry_id: &str) -> Self {
        Self {
            entry_id: entry_id.to_string(),
            state: EntryState::Created,
            phase: Phase::Pending,
            current_job: None,
            done: 0,
            total: 0,
            completed: 0,
            live_hosts: 0,
            open_ports: 0,
            findings: 0,
            errors: 0,
            warnings: 0,
            started_at: None,
            updated_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Synchronized owner of an entry's [`Stage`]
#[derive(Debug, Clone)]
pub struct StageTracker {
    inner: Arc<RwLock<Stage>>,
}

impl StageTracker {
    pub fn new(entry_id: &str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Stage::new(entry_id))),
        }
    }

    /// Consistent copy of the current stage
    pub fn snapshot(&self) -> Stage {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, f: impl FnOnce(&mut Stage)) {
        let mut stage = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut stage);
        stage.updated_at = Utc::now();
    }

    pub fn start(&self) {
        self.update(|stage| {
            stage.state = EntryState::Running;
            stage.started_at = Some(Utc::now());
        });
    }

    /// Move to a later phase; requests to go back are ignored
    pub fn enter_phase(&self, phase: Phase, total: usize) {
        self.update(|stage| {
            if phase <= stage.phase {
                log::warn!("ignoring phase change {} -> {}", stage.phase, phase);
                return;
            }
            log::info!("entry {}: entering {} ({} units)", stage.entry_id, phase, total);
            stage.phase = phase;
            stage.current_job = None;
            stage.done = 0;
            stage.total = total;
        });
    }

    /// Start the job at `index`; only valid during the jobs phase
    pub fn enter_job(&self, index: usize, name: &str) {
        self.update(|stage| {
            if stage.phase != Phase::Jobs {
                log::warn!("job {} started outside the jobs phase", name);
                return;
            }
            if let Some(current) = &stage.current_job {
                if index <= current.index {
                    return;
                }
            }
            stage.current_job = Some(CurrentJob {
                index,
                name: name.to_string(),
            });
            stage.done = 0;
            stage.total = 0;
        });
    }

    /// Grow the unit count of the current phase or job
    pub fn add_total(&self, units: usize) {
        self.update(|stage| stage.total += units);
    }

    pub fn advance(&self, units: usize) {
        self.update(|stage| {
            stage.done += units;
            stage.completed += units as u64;
        });
    }

    pub fn record_live_host(&self) {
        self.update(|stage| stage.live_hosts += 1);
    }

    pub fn set_live_hosts(&self, live_hosts: usize) {
        self.update(|stage| stage.live_hosts = live_hosts);
    }

    pub fn record_open_port(&self) {
        self.update(|stage| stage.open_ports += 1);
    }

    pub fn record_finding(&self) {
        self.update(|stage| stage.findings += 1);
    }

    pub fn record_error(&self) {
        self.update(|stage| stage.errors += 1);
    }

    pub fn record_warning(&self) {
        self.update(|stage| stage.warnings += 1);
    }

    /// Enter a terminal state. A completed run also moves to `Finished`.
    pub fn finish(&self, state: EntryState) {
        self.update(|stage| {
            if stage.state.is_terminal() {
                return;
            }
            stage.state = state;
            if state == EntryState::Completed {
                stage.phase = Phase::Finished;
                stage.current_job = None;
            }
            stage.finished_at = Some(Utc::now());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_snapshot() {
        let tracker = StageTracker::new("abc");
        let stage = tracker.snapshot();
        assert_eq!(stage.state, EntryState::Created);
        assert_eq!(stage.phase, Phase::Pending);
        assert!(stage.started_at.is_none());
    }

    #[test]
    fn test_phases_never_regress() {
        let tracker = StageTracker::new("abc");
        tracker.start();
        tracker.enter_phase(Phase::PortScanning, 10);
        tracker.advance(3);
        tracker.enter_phase(Phase::HostDiscovery, 5);

        let stage = tracker.snapshot();
        assert_eq!(stage.phase, Phase::PortScanning);
        assert_eq!(stage.done, 3);
        assert_eq!(stage.total, 10);
    }

    #[test]
    fn test_completed_counter_is_cumulative() {
        let tracker = StageTracker::new("abc");
        tracker.start();
        tracker.enter_phase(Phase::HostDiscovery, 2);
        tracker.advance(2);
        tracker.enter_phase(Phase::Jobs, 0);
        tracker.enter_job(0, "first");
        tracker.add_total(4);
        tracker.advance(1);

        let stage = tracker.snapshot();
        assert_eq!(stage.done, 1);
        assert_eq!(stage.total, 4);
        assert_eq!(stage.completed, 3);
        assert_eq!(stage.current_job.unwrap().name, "first");
    }

    #[test]
    fn test_terminal_state_sticks() {
        let tracker = StageTracker::new("abc");
        tracker.start();
        tracker.enter_phase(Phase::HostDiscovery, 1);
        tracker.finish(EntryState::Stopped);
        tracker.finish(EntryState::Completed);

        let stage = tracker.snapshot();
        assert_eq!(stage.state, EntryState::Stopped);
        assert_eq!(stage.phase, Phase::HostDiscovery);
        assert!(stage.finished_at.is_some());
    }
}
