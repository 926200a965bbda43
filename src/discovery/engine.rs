//! Host discovery driver

use super::{DiscoveryKind, DiscoveryMethod, DiscoveryResult, IcmpDiscovery, TcpDiscovery};
use crate::config::{DiscoveryPlan, StageSettings, RETRY_BASE_DELAY};
use crate::engine::stage::StageTracker;
use crate::engines::{StageAbort, WorkerPool};
use crate::error::{retry_with_backoff, EngineError, ErrorClass};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Method name reported for hosts that skipped discovery
pub const PASSTHROUGH: &str = "passthrough";

pub struct HostDiscoveryEngine {
    methods: Arc<[Arc<dyn DiscoveryMethod>]>,
    settings: StageSettings,
}

impl HostDiscoveryEngine {
    pub fn new(plan: &DiscoveryPlan) -> Self {
        let timeout = plan.settings.timeout;
        let methods = plan
            .methods
            .iter()
            .map(|kind| -> Arc<dyn DiscoveryMethod> {
                match kind {
                    DiscoveryKind::Tcp => Arc::new(TcpDiscovery::new(plan.probe_ports.clone(), timeout)),
                    DiscoveryKind::Icmp => Arc::new(IcmpDiscovery::new(timeout)),
                }
            })
            .collect::<Vec<_>>();

        Self::with_methods(methods, plan.settings.clone())
    }

    pub fn with_methods(methods: Vec<Arc<dyn DiscoveryMethod>>, settings: StageSettings) -> Self {
        Self {
            methods: methods.into(),
            settings,
        }
    }

    /// Return the live subset of `targets`, in input order.
    ///
    /// A disabled stage passes every target through. On cancellation the
    /// hosts confirmed so far are returned.
    pub async fn run(
        &self,
        targets: &[IpAddr],
        tracker: &StageTracker,
        cancel: &CancellationToken,
    ) -> crate::Result<Vec<DiscoveryResult>> {
        if !self.settings.enabled {
            log::info!("host discovery disabled, treating {} targets as live", targets.len());
            tracker.set_live_hosts(targets.len());
            tracker.advance(targets.len());
            return Ok(targets
                .iter()
                .map(|&target| DiscoveryResult::new(target, true, PASSTHROUGH))
                .collect());
        }

        let stage_cancel = cancel.child_token();
        let abort = StageAbort::new(stage_cancel.clone());
        let mut pool = WorkerPool::new(self.settings.concurrency, self.settings.rate_limit, stage_cancel.clone());
        let live: Arc<Mutex<Vec<DiscoveryResult>>> = Arc::new(Mutex::new(Vec::new()));

        for &target in targets {
            let methods = Arc::clone(&self.methods);
            let retries = self.settings.retries;
            let tracker = tracker.clone();
            let live = Arc::clone(&live);
            let abort = abort.clone();
            let item_cancel = stage_cancel.clone();

            let work = async move {
                let (methods, cancel) = (&methods, &item_cancel);
                let outcome = retry_with_backoff(
                    move |_| probe_once(methods, target, cancel),
                    retries,
                    RETRY_BASE_DELAY,
                    &item_cancel,
                )
                .await;

                match outcome {
                    Ok(result) => {
                        log::debug!("{} is up ({})", target, result.method_used);
                        live.lock().unwrap_or_else(PoisonError::into_inner).push(result);
                        tracker.record_live_host();
                    }
                    Err(EngineError::Timeout) => log::debug!("{} is down", target),
                    // cancelled mid-probe; the host is neither up nor done
                    Err(EngineError::Stopped) => return,
                    Err(e) if e.class() == ErrorClass::Fatal => abort.abort(e),
                    Err(e) => {
                        log::debug!("discovery of {} failed: {}", target, e);
                        tracker.record_error();
                    }
                }
                tracker.advance(1);
            };

            if !pool.submit(work).await? {
                break;
            }
        }

        pool.join().await;

        if let Some(error) = abort.take() {
            return Err(error);
        }

        let mut live = std::mem::take(&mut *live.lock().unwrap_or_else(PoisonError::into_inner));
        let position: HashMap<IpAddr, usize> = targets.iter().enumerate().map(|(i, &t)| (t, i)).collect();
        live.sort_by_key(|result| position.get(&result.target).copied().unwrap_or(usize::MAX));
        Ok(live)
    }
}

/// One round of every method; a host that answers none of them is a timeout
async fn probe_once(
    methods: &[Arc<dyn DiscoveryMethod>],
    target: IpAddr,
    cancel: &CancellationToken,
) -> crate::Result<DiscoveryResult> {
    let mut last_error = None;

    for method in methods {
        let discovered = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Stopped),
            discovered = method.discover(target) => discovered,
        };
        match discovered {
            Ok(result) if result.is_alive => return Ok(result),
            Ok(_) => {}
            Err(e) if e.class() == ErrorClass::Fatal => return Err(e),
            Err(e) => {
                log::debug!("{} probe of {} failed: {}", method.method_name(), target, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(EngineError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn settings(enabled: bool, retries: u32) -> StageSettings {
        StageSettings {
            enabled,
            timeout: Duration::from_millis(200),
            retries,
            format: OutputFormat::None,
            rate_limit: 0,
            concurrency: 4,
        }
    }

    /// Answers for even last octets only, counting calls
    struct EvenHosts {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl DiscoveryMethod for EvenHosts {
        async fn discover(&self, target: IpAddr) -> crate::Result<DiscoveryResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let alive = match target {
                IpAddr::V4(v4) => v4.octets()[3] % 2 == 0,
                IpAddr::V6(_) => false,
            };
            Ok(DiscoveryResult::new(target, alive, "even"))
        }

        fn method_name(&self) -> &str {
            "even"
        }
    }

    /// Never answers within any sane timeout
    struct Stalls;

    #[async_trait::async_trait]
    impl DiscoveryMethod for Stalls {
        async fn discover(&self, target: IpAddr) -> crate::Result<DiscoveryResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(DiscoveryResult::new(target, false, "stalls"))
        }

        fn method_name(&self) -> &str {
            "stalls"
        }
    }

    fn targets(n: u8) -> Vec<IpAddr> {
        (1..=n).map(|i| IpAddr::from([10, 0, 0, i])).collect()
    }

    #[tokio::test]
    async fn test_live_subset_and_retries() {
        let method = Arc::new(EvenHosts { calls: AtomicU32::new(0) });
        let as_method: Arc<dyn DiscoveryMethod> = method.clone();
        let engine = HostDiscoveryEngine::with_methods(vec![as_method], settings(true, 1));
        let tracker = StageTracker::new("t");

        let live = engine.run(&targets(6), &tracker, &CancellationToken::new()).await.unwrap();

        let hosts: Vec<IpAddr> = live.iter().map(|r| r.target).collect();
        assert_eq!(hosts, vec![IpAddr::from([10, 0, 0, 2]), IpAddr::from([10, 0, 0, 4]), IpAddr::from([10, 0, 0, 6])]);
        // 3 live hosts answer once, 3 dead hosts are tried count + 1 times
        assert_eq!(method.calls.load(Ordering::SeqCst), 3 + 3 * 2);
        assert_eq!(tracker.snapshot().live_hosts, 3);
        assert_eq!(tracker.snapshot().done, 6);
    }

    #[tokio::test]
    async fn test_disabled_passes_everything_through() {
        let engine = HostDiscoveryEngine::with_methods(Vec::new(), settings(false, 0));
        let tracker = StageTracker::new("t");

        let live = engine.run(&targets(5), &tracker, &CancellationToken::new()).await.unwrap();

        assert_eq!(live.len(), 5);
        assert!(live.iter().all(|r| r.is_alive && r.method_used == PASSTHROUGH));
        assert_eq!(tracker.snapshot().live_hosts, 5);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_probes() {
        let stalls: Arc<dyn DiscoveryMethod> = Arc::new(Stalls);
        let engine = HostDiscoveryEngine::with_methods(vec![stalls], settings(true, 3));
        let tracker = StageTracker::new("t");
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let start = std::time::Instant::now();
        let live = engine.run(&targets(8), &tracker, &cancel).await.unwrap();
        canceller.await.unwrap();

        // bounded by the cancel, not by the 30s probes
        assert!(start.elapsed() < Duration::from_millis(1000), "took {:?}", start.elapsed());
        assert!(live.is_empty());
        assert_eq!(tracker.snapshot().done, 0);
        assert_eq!(tracker.snapshot().errors, 0);
    }
}
