//! Execution primitives shared by the pipeline stages

pub mod pool;

pub use pool::WorkerPool;

use crate::error::EngineError;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// First fatal error raised by a stage's workers.
///
/// Recording an error cancels the stage token, which stops the stage's pool
/// from admitting more work without touching the entry's own token.
#[derive(Debug, Clone)]
pub struct StageAbort {
    stage_cancel: CancellationToken,
    error: Arc<Mutex<Option<EngineError>>>,
}

impl StageAbort {
    pub fn new(stage_cancel: CancellationToken) -> Self {
        Self {
            stage_cancel,
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// Record `error` unless one is already recorded, then cancel the stage
    pub fn abort(&self, error: EngineError) {
        {
            let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                log::error!("stage aborted: {}", error);
                *slot = Some(error);
            }
        }
        self.stage_cancel.cancel();
    }

    pub fn take(&self) -> Option<EngineError> {
        self.error.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_wins() {
        let parent = CancellationToken::new();
        let stage = parent.child_token();
        let abort = StageAbort::new(stage.clone());

        abort.abort(EngineError::ResourceExhausted("first".into()));
        abort.abort(EngineError::ResourceExhausted("second".into()));

        assert!(stage.is_cancelled());
        assert!(!parent.is_cancelled());
        match abort.take() {
            Some(EngineError::ResourceExhausted(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(abort.take().is_none());
    }
}
