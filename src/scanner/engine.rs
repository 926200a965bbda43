//! TCP connect port scan over live hosts

use crate::config::{PortScanPlan, StageSettings, RETRY_BASE_DELAY};
use crate::engine::result::ResultAggregator;
use crate::engine::stage::StageTracker;
use crate::engines::{StageAbort, WorkerPool};
use crate::error::{retry_with_backoff, EngineError, ErrorClass};
use crate::network::socket::TcpConnectScanner;
use crate::network::PortState;
use crate::scanner::{OpenPort, PortMap};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Port scan stage driver
pub struct PortScanEngine {
    scanner: TcpConnectScanner,
    settings: StageSettings,
    ports: Vec<u16>,
}

impl PortScanEngine {
    pub fn new(plan: &PortScanPlan) -> Self {
        Self {
            scanner: TcpConnectScanner::new(plan.settings.timeout),
            settings: plan.settings.clone(),
            ports: plan.ports.clone(),
        }
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Probe every (host, port) pair.
    ///
    /// Returns whatever was found when `cancel` fires; only a fatal error
    /// from a worker fails the stage.
    pub async fn run(
        &self,
        hosts: &[IpAddr],
        tracker: &StageTracker,
        results: &ResultAggregator,
        cancel: &CancellationToken,
    ) -> crate::Result<PortMap> {
        let stage_cancel = cancel.child_token();
        let abort = StageAbort::new(stage_cancel.clone());
        let mut pool = WorkerPool::new(self.settings.concurrency, self.settings.rate_limit, stage_cancel.clone());

        let found: Arc<Mutex<BTreeMap<IpAddr, Vec<OpenPort>>>> =
            Arc::new(Mutex::new(hosts.iter().map(|&host| (host, Vec::new())).collect()));

        log::info!(
            "port scan: {} hosts x {} ports, concurrency {}, rate {}",
            hosts.len(),
            self.ports.len(),
            self.settings.concurrency,
            self.settings.rate_limit
        );

        'hosts: for &host in hosts {
            for &port in &self.ports {
                let scanner = self.scanner.clone();
                let retries = self.settings.retries;
                let tracker = tracker.clone();
                let results = results.clone();
                let found = Arc::clone(&found);
                let abort = abort.clone();
                let item_cancel = stage_cancel.clone();

                let work = async move {
                    let scanner = &scanner;
                    let outcome = retry_with_backoff(
                        move |_| async move {
                            match scanner.scan_port(host, port).await? {
                                PortState::Open => Ok(true),
                                PortState::Closed => Ok(false),
                                PortState::Filtered => Err(EngineError::Timeout),
                            }
                        },
                        retries,
                        RETRY_BASE_DELAY,
                        &item_cancel,
                    )
                    .await;

                    match outcome {
                        Ok(true) => {
                            log::debug!("{}:{} open", host, port);
                            let open = OpenPort::new(port);
                            found
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .entry(host)
                                .or_default()
                                .push(open.clone());
                            results.add_open_port(host, open);
                            tracker.record_open_port();
                        }
                        Ok(false) | Err(EngineError::Timeout) => {}
                        Err(e) if e.class() == ErrorClass::Fatal => abort.abort(e),
                        Err(e) => {
                            log::debug!("{}:{} probe failed: {}", host, port, e);
                            tracker.record_error();
                        }
                    }
                    tracker.advance(1);
                };

                if !pool.submit(work).await? {
                    break 'hosts;
                }
            }
        }

        pool.join().await;

        if let Some(error) = abort.take() {
            return Err(error);
        }

        let mut map = std::mem::take(&mut *found.lock().unwrap_or_else(PoisonError::into_inner));
        for ports in map.values_mut() {
            ports.sort_by_key(|p| p.port);
        }
        Ok(PortMap::Scanned(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn plan(ports: Vec<u16>) -> PortScanPlan {
        PortScanPlan {
            settings: StageSettings {
                enabled: true,
                timeout: Duration::from_millis(500),
                retries: 0,
                format: OutputFormat::None,
                rate_limit: 0,
                concurrency: 8,
            },
            ports,
        }
    }

    #[tokio::test]
    async fn test_finds_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let host: IpAddr = "127.0.0.1".parse().unwrap();
        let tracker = StageTracker::new("t");
        let results = ResultAggregator::new("t", 1);
        let engine = PortScanEngine::new(&plan(vec![open, closed]));

        let map = engine
            .run(&[host], &tracker, &results, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(map.ports_for(host), Some(vec![open]));
        assert_eq!(tracker.snapshot().open_ports, 1);
        assert_eq!(tracker.snapshot().done, 2);
        assert_eq!(results.snapshot().open_port_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_scan_returns_partial_map() {
        let host: IpAddr = "127.0.0.1".parse().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let engine = PortScanEngine::new(&plan(vec![1, 2, 3]));
        let map = engine
            .run(&[host], &StageTracker::new("t"), &ResultAggregator::new("t", 1), &cancel)
            .await
            .unwrap();

        assert_eq!(map.ports_for(host), Some(vec![]));
    }
}
