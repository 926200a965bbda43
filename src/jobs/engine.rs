//! Job stage driver

use super::executor::{Exchange, HttpExecutor, TcpExecutor};
use super::{Finding, JobTarget};
use crate::config::{JobPlan, RETRY_BASE_DELAY};
use crate::engine::result::ResultAggregator;
use crate::engine::stage::StageTracker;
use crate::engines::{StageAbort, WorkerPool};
use crate::error::{retry_with_backoff, EngineError, ErrorClass};
use crate::network::Protocol;
use crate::scanner::PortMap;
use crate::templates::{MatcherSet, ParsedTemplate, RawTemplate, TemplateCache};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Port used by HTTP blocks when nothing is known about open ports
pub const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(Debug, Clone, Copy)]
enum Block {
    Tcp(usize),
    Http(usize),
}

/// One template block against one target
#[derive(Debug, Clone)]
struct WorkItem {
    template: Arc<ParsedTemplate>,
    block: Block,
    target: JobTarget,
}

impl WorkItem {
    fn matchers(&self) -> &MatcherSet {
        match self.block {
            Block::Tcp(i) => &self.template.tcp[i].matchers,
            Block::Http(i) => &self.template.http[i].matchers,
        }
    }

    fn protocol(&self) -> Protocol {
        match self.block {
            Block::Tcp(_) => Protocol::Tcp,
            Block::Http(_) => Protocol::Http,
        }
    }
}

pub struct JobEngine {
    plan: JobPlan,
    tcp: TcpExecutor,
    http: Arc<HttpExecutor>,
}

impl JobEngine {
    pub fn new(plan: JobPlan) -> Self {
        let timeout = plan.settings.timeout;
        Self {
            plan,
            tcp: TcpExecutor::new(timeout),
            http: Arc::new(HttpExecutor::new(timeout)),
        }
    }

    pub fn plan(&self) -> &JobPlan {
        &self.plan
    }

    /// Run every template against `hosts` and return this job's findings.
    ///
    /// Findings also go to `results` as they are produced, so a stopped
    /// run keeps them.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        templates: &[RawTemplate],
        hosts: &[IpAddr],
        ports: &PortMap,
        cache: &TemplateCache,
        tracker: &StageTracker,
        results: &ResultAggregator,
        cancel: &CancellationToken,
    ) -> crate::Result<Vec<Finding>> {
        let index = self.plan.index;
        tracker.enter_job(index, &self.plan.name);

        let items = self.plan_items(templates, hosts, ports, cache, tracker, results);
        tracker.add_total(items.len());
        log::info!(
            "job '{}' ({}): {} templates, {} requests",
            self.plan.name,
            self.plan.kind,
            templates.len(),
            items.len()
        );

        let stage_cancel = cancel.child_token();
        let abort = StageAbort::new(stage_cancel.clone());
        let mut pool = WorkerPool::new(self.plan.settings.concurrency, self.plan.settings.rate_limit, stage_cancel.clone());
        let found: Arc<Mutex<Vec<Finding>>> = Arc::new(Mutex::new(Vec::new()));

        for item in items {
            let tcp = self.tcp.clone();
            let http = Arc::clone(&self.http);
            let retries = self.plan.settings.retries;
            let job = self.plan.name.clone();
            let kind = self.plan.kind.clone();
            let tracker = tracker.clone();
            let results = results.clone();
            let found = Arc::clone(&found);
            let abort = abort.clone();
            let item_cancel = stage_cancel.clone();

            let work = async move {
                let (tcp, http, request, cancel) = (&tcp, &*http, &item, &item_cancel);
                let outcome = retry_with_backoff(
                    move |_| execute(tcp, http, request, cancel),
                    retries,
                    RETRY_BASE_DELAY,
                    &item_cancel,
                )
                .await;

                match outcome {
                    Ok(exchanges) => {
                        results.job_executed(index);
                        for exchange in exchanges {
                            let outcome = item.matchers().evaluate(&exchange.response);
                            if !outcome.matched {
                                continue;
                            }
                            log::info!("[{}] {} matched at {}", job, item.template.id, exchange.matched_at);
                            let finding = Finding::new(
                                &item.template,
                                &job,
                                &kind,
                                item.target,
                                item.protocol(),
                                exchange.matched_at,
                                outcome.evidence,
                            );
                            results.add_finding(index, finding.clone());
                            tracker.record_finding();
                            found.lock().unwrap_or_else(PoisonError::into_inner).push(finding);
                        }
                    }
                    // abandoned on cancel; not counted as done
                    Err(EngineError::Stopped) => return,
                    Err(e) if e.class() == ErrorClass::Fatal => abort.abort(e),
                    Err(e) => {
                        log::debug!("[{}] {} against {} failed: {}", job, item.template.id, item.target, e);
                        results.job_error(index);
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

        let findings = std::mem::take(&mut *found.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(findings)
    }

    /// Expand templates into work items, recording skipped templates and blocks
    fn plan_items(
        &self,
        templates: &[RawTemplate],
        hosts: &[IpAddr],
        ports: &PortMap,
        cache: &TemplateCache,
        tracker: &StageTracker,
        results: &ResultAggregator,
    ) -> Vec<WorkItem> {
        let warn = |message: String| {
            log::warn!("job '{}': {}", self.plan.name, message);
            tracker.record_warning();
            results.job_warning(self.plan.index, message);
        };

        let mut items = Vec::new();
        for raw in templates {
            let template = match cache.get_or_parse(raw) {
                Ok(template) => template,
                Err(e) => {
                    warn(e.to_string());
                    continue;
                }
            };

            for (i, block) in template.tcp.iter().enumerate() {
                if block.tls_hosts > 0 {
                    warn(format!("template '{}' tcp[{}]: tls hosts are not supported", template.id, i));
                    if block.plain_hosts == 0 {
                        continue;
                    }
                }
                if block.ports.is_empty() {
                    warn(format!("template '{}' tcp[{}]: no port to connect to", template.id, i));
                    continue;
                }

                for &host in hosts {
                    let selected: Vec<u16> = match ports.ports_for(host) {
                        Some(open) => block.ports.iter().copied().filter(|p| open.contains(p)).collect(),
                        None => block.ports.clone(),
                    };
                    items.extend(selected.into_iter().map(|port| WorkItem {
                        template: Arc::clone(&template),
                        block: Block::Tcp(i),
                        target: JobTarget::new(host, port),
                    }));
                }
            }

            for (i, block) in template.http.iter().enumerate() {
                for &host in hosts {
                    let selected: Vec<u16> = match (ports.ports_for(host), block.port) {
                        (Some(open), Some(port)) if open.contains(&port) => vec![port],
                        (Some(open), _) => open,
                        (None, port) => vec![port.unwrap_or(DEFAULT_HTTP_PORT)],
                    };
                    items.extend(selected.into_iter().map(|port| WorkItem {
                        template: Arc::clone(&template),
                        block: Block::Http(i),
                        target: JobTarget::new(host, port),
                    }));
                }
            }
        }
        items
    }
}

async fn execute(
    tcp: &TcpExecutor,
    http: &HttpExecutor,
    item: &WorkItem,
    cancel: &CancellationToken,
) -> crate::Result<Vec<Exchange>> {
    match item.block {
        Block::Tcp(i) => tcp
            .execute(&item.template.tcp[i], item.target, cancel)
            .await
            .map(|exchange| vec![exchange]),
        Block::Http(i) => http.execute(&item.template.http[i], item.target, cancel).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StageSettings, TemplateProducer};
    use crate::engine::stage::Phase;
    use crate::output::OutputFormat;
    use crate::scanner::OpenPort;
    use crate::templates::FnSource;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn plan() -> JobPlan {
        let producer: TemplateProducer = Arc::new(Vec::new);
        JobPlan {
            index: 0,
            name: "asset".to_string(),
            kind: "asset-scan".to_string(),
            source: Arc::new(FnSource::new(producer)),
            settings: StageSettings {
                enabled: true,
                timeout: Duration::from_secs(2),
                retries: 0,
                format: OutputFormat::None,
                rate_limit: 0,
                concurrency: 8,
            },
        }
    }

    /// Answers every connection like a server rejecting a password
    async fn fake_postgres() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buffer = [0u8; 256];
                    let _ = socket.read(&mut buffer).await;
                    let _ = socket.write_all(b"E\x00\x00\x00SFATAL C28P01 password authentication failed").await;
                });
            }
        });
        port
    }

    fn pgsql_template(port: u16) -> RawTemplate {
        RawTemplate::new(
            "pgsql-detect",
            format!(
                r#"id: pgsql-detect
info:
  name: PostgreSQL Authentication - Detect
  severity: info
  tags: network,postgresql
tcp:
  - inputs:
      - data: "000000500003000075736572"
        type: hex
    host:
      - "{{{{Hostname}}}}"
    port: {}
    matchers-condition: and
    matchers:
      - type: word
        words: ["C0A000", "28P01"]
      - type: word
        words: ["HTTP/1.1"]
        negative: true
"#,
                port
            ),
        )
    }

    fn tracker() -> StageTracker {
        let tracker = StageTracker::new("e");
        tracker.start();
        tracker.enter_phase(Phase::Jobs, 1);
        tracker
    }

    #[tokio::test]
    async fn test_pgsql_template_finds_fake_server() {
        let port = fake_postgres().await;
        let host: IpAddr = "127.0.0.1".parse().unwrap();
        let ports = PortMap::Scanned(BTreeMap::from([(host, vec![OpenPort::new(port)])]));
        let templates = vec![pgsql_template(port), RawTemplate::new("broken", "id: broken\n")];

        let tracker = tracker();
        let results = ResultAggregator::new("e", 1);
        results.begin_job(0, "asset", "asset-scan");
        let cache = TemplateCache::new();

        let findings = JobEngine::new(plan())
            .run(&templates, &[host], &ports, &cache, &tracker, &results, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].template_id, "pgsql-detect");
        assert_eq!(findings[0].evidence, vec!["28P01".to_string()]);
        assert_eq!(findings[0].port, Some(port));
        assert_eq!(findings[0].tags, vec!["network", "postgresql"]);

        let snapshot = results.snapshot();
        let job = snapshot.job(0).unwrap();
        assert_eq!(job.findings, 1);
        assert_eq!(job.executed, 1);
        assert_eq!(job.warnings.len(), 1);
        assert_eq!(tracker.snapshot().warnings, 1);
    }

    #[tokio::test]
    async fn test_closed_template_port_is_skipped() {
        let host: IpAddr = "127.0.0.1".parse().unwrap();
        let ports = PortMap::Scanned(BTreeMap::from([(host, vec![OpenPort::new(22)])]));

        let tracker = tracker();
        let results = ResultAggregator::new("e", 1);
        let findings = JobEngine::new(plan())
            .run(
                &[pgsql_template(5432)],
                &[host],
                &ports,
                &TemplateCache::new(),
                &tracker,
                &results,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(findings.is_empty());
        assert_eq!(tracker.snapshot().total, 0);
    }

    #[test]
    fn test_host_only_policy_without_port_scan() {
        let engine = JobEngine::new(plan());
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        let http = RawTemplate::new(
            "web",
            "id: web\nhttp:\n  - path: ['{{BaseURL}}/']\n    matchers: [{type: status, status: [200]}]\n",
        );

        let items = engine.plan_items(
            &[pgsql_template(5432), http],
            &[host],
            &PortMap::Unavailable,
            &TemplateCache::new(),
            &tracker(),
            &ResultAggregator::new("e", 1),
        );

        let targets: Vec<u16> = items.iter().map(|item| item.target.port).collect();
        assert_eq!(targets, vec![5432, DEFAULT_HTTP_PORT]);
    }

    #[test]
    fn test_http_block_port_falls_back_to_open_ports() {
        let engine = JobEngine::new(plan());
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        let ports = PortMap::Scanned(BTreeMap::from([(host, vec![OpenPort::new(22), OpenPort::new(8080)])]));
        let web = |id: &str, port: u16| {
            RawTemplate::new(
                id,
                format!(
                    "id: {}\nhttp:\n  - path: ['{{{{BaseURL}}}}/']\n    port: {}\n    matchers: [{{type: status, status: [200]}}]\n",
                    id, port
                ),
            )
        };

        let items = engine.plan_items(
            &[web("alt", 8080), web("tls", 443)],
            &[host],
            &ports,
            &TemplateCache::new(),
            &tracker(),
            &ResultAggregator::new("e", 1),
        );

        let targets: Vec<(&str, u16)> = items
            .iter()
            .map(|item| (item.template.id.as_str(), item.target.port))
            .collect();
        assert_eq!(targets, vec![("alt", 8080), ("tls", 22), ("tls", 8080)]);
    }
}
