//! EagleEye - staged network reconnaissance
//!
//! Resolve targets, find the live hosts, scan their ports, then run
//! template-driven jobs against what was found. Progress is observable at
//! any time and a run can be stopped without losing what it found.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod engines;
pub mod error;
pub mod jobs;
pub mod network;
pub mod output;
pub mod scanner;
pub mod templates;
pub mod top_ports;
pub mod utils;

// Re-export commonly used types
pub use config::{EngineConfig, HostDiscoveryOptions, JobOptions, Options, PortScanningOptions};
pub use engine::{Engine, Entry, EntryResult, EntryState, Phase, Stage};
pub use error::{EngineError, EngineResult, TemplateParseError};
pub use jobs::Finding;
pub use output::OutputFormat;
pub use templates::RawTemplate;
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, EngineError>;
