//! Bounded, rate-limited worker pool shared by every stage
//!
//! Admission is gated twice: a semaphore caps the items in flight and a token
//! bucket caps how many are admitted per second. Both waits observe the
//! cancellation token. Items already running are never aborted; they finish
//! under their own timeouts and [`WorkerPool::join`] waits for them.

use crate::error::EngineError;
use crate::network::protocol::RateLimiter;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    limiter: RateLimiter,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    concurrency: usize,
}

impl WorkerPool {
    /// Create a pool; `rate_limit` of 0 means unlimited
    pub fn new(concurrency: usize, rate_limit: u32, cancel: CancellationToken) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            limiter: RateLimiter::new(rate_limit as u64),
            cancel,
            tasks: JoinSet::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            concurrency,
        }
    }

    /// Wait for admission and spawn `work`.
    ///
    /// Returns `Ok(false)` when the pool was cancelled before the item was
    /// admitted, and `ResourceExhausted` when the pool has been closed.
    pub async fn submit<F>(&mut self, work: F) -> crate::Result<bool>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap_finished();

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(false),
            permit = self.semaphore.clone().acquire_owned() => permit.map_err(|_| {
                EngineError::ResourceExhausted("worker pool is closed".to_string())
            })?,
        };

        while !self.limiter.can_send() {
            let delay = self.limiter.delay_until_next();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let in_flight = Arc::clone(&self.in_flight);
        self.tasks.spawn(async move {
            work.await;
            // Decrement before the permit is released so the counter never
            // exceeds the concurrency limit.
            in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });

        Ok(true)
    }

    /// Wait for every admitted item to finish
    pub async fn join(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    log::error!("worker task panicked: {}", e);
                }
            }
        }
    }

    /// Refuse further admissions
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of items observed in flight at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    log::error!("worker task panicked: {}", e);
                }
            }
        }
    }
}
