//! Error handling for the eagleeye engine
//!
//! Errors are grouped into four classes. Configuration and setup errors
//! surface from entry creation and `Entry::run`; per-item errors are absorbed
//! by the stage that produced them and only show up as counters; fatal errors
//! stop the current stage while the partial result is kept.

use std::time::Duration;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid target spec: {0}")]
    InvalidTargetSpec(String),

    #[error("Target set is empty after exclusions")]
    EmptyTargetSet,

    #[error("Invalid option {field}: {reason}")]
    InvalidOption { field: String, reason: String },

    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Cannot load templates for job '{job}': {reason}")]
    TemplateSource { job: String, reason: String },

    #[error(transparent)]
    TemplateParse(#[from] TemplateParseError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout error")]
    Timeout,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Output error: {0}")]
    Output(String),

    #[error("Entry has already been run")]
    AlreadyStarted,

    #[error("Engine is closed")]
    EngineClosed,

    #[error("Entry was stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A template whose source text could not be turned into a detection definition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Template '{id}' failed to parse: {cause}")]
pub struct TemplateParseError {
    pub id: String,
    pub cause: String,
}

impl TemplateParseError {
    pub fn new(id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cause: cause.into(),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Coarse classification used to decide how far an error propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad options; the entry is never created
    Configuration,
    /// The entry cannot start; it moves straight to `Failed`
    Setup,
    /// One target or template failed; recorded and skipped
    PerItem,
    /// The current stage cannot continue
    Fatal,
}

impl EngineError {
    /// Shorthand for an [`EngineError::InvalidOption`]
    pub fn invalid_option(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidOption {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidTargetSpec(_)
            | EngineError::EmptyTargetSet
            | EngineError::InvalidOption { .. }
            | EngineError::AlreadyStarted
            | EngineError::EngineClosed => ErrorClass::Configuration,
            EngineError::Setup(_)
            | EngineError::TemplateSource { .. }
            | EngineError::Output(_)
            | EngineError::Io(_) => ErrorClass::Setup,
            EngineError::TemplateParse(_)
            | EngineError::Network(_)
            | EngineError::Timeout => ErrorClass::PerItem,
            EngineError::ResourceExhausted(_) | EngineError::Stopped => ErrorClass::Fatal,
        }
    }

    /// Whether another attempt at the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Network(_) | EngineError::Timeout)
    }
}

/// Convert common errors to EngineError
impl From<std::net::AddrParseError> for EngineError {
    fn from(e: std::net::AddrParseError) -> Self {
        EngineError::InvalidTargetSpec(e.to_string())
    }
}

impl From<std::num::ParseIntError> for EngineError {
    fn from(e: std::num::ParseIntError) -> Self {
        EngineError::invalid_option("number", e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for EngineError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        EngineError::Timeout
    }
}

/// Whether an IO error means the process ran out of sockets or buffers
pub fn is_resource_exhaustion(error: &std::io::Error) -> bool {
    match error.raw_os_error() {
        Some(code) => code == libc::EMFILE || code == libc::ENFILE || code == libc::ENOBUFS,
        None => error.kind() == std::io::ErrorKind::OutOfMemory,
    }
}

/// Delay before the given retry attempt: exponential with a small jitter, capped
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    use rand::Rng;

    let exponential = base.saturating_mul(2u32.saturating_pow(attempt.min(10)));
    let capped = exponential.min(Duration::from_secs(5));
    let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 10 + 1);
    capped + Duration::from_millis(jitter)
}

/// Retry an operation up to `retries` extra times while the error is retryable.
///
/// Gives up early when `cancel` fires; the last error is returned.
pub async fn retry_with_backoff<F, T, Fut>(
    mut operation: F,
    retries: u32,
    base_delay: Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> EngineResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retries && !cancel.is_cancelled() => {
                let delay = retry_delay(attempt, base_delay);
                log::debug!("retrying after {:?} (attempt {}/{}): {}", delay, attempt + 1, retries, e);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(e),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
