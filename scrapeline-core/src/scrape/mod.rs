//! Scrape orchestration.
//!
//! The [`ScrapeManager`] follows the discovery [`SyncStream`] and keeps one
//! scrape loop running per resolved target. Fetching and decoding a target
//! is delegated to a [`Scraper`].

mod scrape_loop;
mod target;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use scrapeline_model::{Sample, TargetSets};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::appender::Appendable;
use crate::config::{ScrapeJobConfig, validate_jobs};
use crate::discovery::SyncStream;
use crate::error::{ReceiverError, Result};

use scrape_loop::ScrapeLoop;
pub use target::{ScrapeTarget, TargetHealth, TargetStatus};

/// Fetches one target and decodes the response into samples.
///
/// Returned samples carry the scraped labels including `__name__`. A
/// timestamp of zero means "use the scrape time".
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, target: &ScrapeTarget) -> Result<Vec<Sample>>;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct LoopKey {
    job: String,
    target: u64,
}

struct LoopHandle {
    token: CancellationToken,
    status: Arc<Mutex<TargetStatus>>,
    task: JoinHandle<()>,
}

pub struct ScrapeManager {
    appendable: Arc<dyn Appendable>,
    scraper: Arc<dyn Scraper>,
    shutdown: CancellationToken,
    jobs: Mutex<HashMap<String, Arc<ScrapeJobConfig>>>,
    loops: Mutex<HashMap<LoopKey, LoopHandle>>,
}

impl fmt::Debug for ScrapeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut jobs: Vec<String> = self.jobs.lock().keys().cloned().collect();
        jobs.sort();
        f.debug_struct("ScrapeManager")
            .field("jobs", &jobs)
            .field("loops", &self.loops.lock().len())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ScrapeManager {
    pub fn new(
        appendable: Arc<dyn Appendable>,
        scraper: Arc<dyn Scraper>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            appendable,
            scraper,
            shutdown,
            jobs: Mutex::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Validates and installs the scrape jobs. On error the previous jobs
    /// stay in place.
    pub fn apply_config(&self, jobs: &[ScrapeJobConfig]) -> Result<()> {
        validate_jobs(jobs)?;
        let installed: HashMap<_, _> = jobs
            .iter()
            .map(|job| (job.job_name.clone(), Arc::new(job.clone())))
            .collect();
        debug!(target: "scrapeline::scrape", jobs = installed.len(), "scrape configuration applied");
        *self.jobs.lock() = installed;
        Ok(())
    }

    /// Follows `sync` until the shutdown token is cancelled.
    ///
    /// Returns `Ok(())` on cancellation and an error if the stream ends
    /// while the manager is still supposed to be running.
    pub async fn run(&self, mut sync: SyncStream) -> Result<()> {
        info!(target: "scrapeline::scrape", "scrape manager running");

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                update = sync.next() => match update {
                    Some(sets) => self.reconcile(&sets),
                    None if self.shutdown.is_cancelled() => break Ok(()),
                    None => break Err(ReceiverError::Scrape("discovery sync stream closed".into())),
                },
            }
        };

        self.stop_all().await;
        info!(target: "scrapeline::scrape", "scrape manager stopped");
        outcome
    }

    /// Status of every running scrape loop, ordered by job and instance.
    pub fn active_targets(&self) -> Vec<TargetStatus> {
        let mut statuses: Vec<TargetStatus> = self
            .loops
            .lock()
            .values()
            .map(|handle| handle.status.lock().clone())
            .collect();
        statuses.sort_by(|a, b| (&a.job, &a.instance, &a.url).cmp(&(&b.job, &b.instance, &b.url)));
        statuses
    }

    fn reconcile(&self, sets: &TargetSets) {
        let jobs = self.jobs.lock().clone();
        let mut desired: HashMap<LoopKey, (Arc<ScrapeJobConfig>, ScrapeTarget)> = HashMap::new();

        for (job_name, groups) in sets {
            let Some(job) = jobs.get(job_name) else {
                debug!(target: "scrapeline::scrape", job = %job_name, "ignoring targets for unknown job");
                continue;
            };
            for group in groups {
                for discovered in &group.targets {
                    match target::resolve_target(job, &group.labels, discovered) {
                        Ok(Some(target)) => {
                            let key = LoopKey {
                                job: job_name.clone(),
                                target: target.identity(),
                            };
                            desired.insert(key, (Arc::clone(job), target));
                        }
                        Ok(None) => {
                            debug!(target: "scrapeline::scrape", job = %job_name, labels = %discovered, "target dropped by relabeling");
                        }
                        Err(err) => {
                            warn!(target: "scrapeline::scrape", job = %job_name, error = %err, "skipping invalid target");
                        }
                    }
                }
            }
        }

        let mut loops = self.loops.lock();
        let before = loops.len();
        loops.retain(|key, handle| {
            let keep = desired.contains_key(key);
            if !keep {
                handle.token.cancel();
            }
            keep
        });
        let stopped = before - loops.len();

        let mut started = 0;
        for (key, (job, target)) in desired {
            if loops.contains_key(&key) {
                continue;
            }
            loops.insert(key, self.spawn_loop(job, target));
            started += 1;
        }

        debug!(
            target: "scrapeline::scrape",
            started,
            stopped,
            running = loops.len(),
            "targets reconciled"
        );
    }

    fn spawn_loop(&self, job: Arc<ScrapeJobConfig>, target: ScrapeTarget) -> LoopHandle {
        let token = self.shutdown.child_token();
        let status = Arc::new(Mutex::new(TargetStatus::new(&target)));
        let scrape_loop = ScrapeLoop {
            job,
            target,
            scraper: Arc::clone(&self.scraper),
            appendable: Arc::clone(&self.appendable),
            status: Arc::clone(&status),
            shutdown: token.clone(),
        };
        LoopHandle {
            token,
            status,
            task: tokio::spawn(scrape_loop.run()),
        }
    }

    async fn stop_all(&self) {
        let handles: Vec<LoopHandle> = self.loops.lock().drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            handle.token.cancel();
        }
        let results = join_all(handles.into_iter().map(|handle| handle.task)).await;
        for result in results {
            if let Err(err) = result {
                warn!(target: "scrapeline::scrape", error = %err, "scrape loop ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use scrapeline_model::{ADDRESS_LABEL, INSTANCE_LABEL, LabelSet, METRIC_NAME_LABEL, TargetGroup};

    use super::*;
    use crate::appender::Appender;
    use crate::discovery::{DiscoveryConfig, DiscoveryManager, StaticConfig};
    use crate::relabel::inject_scrape_job_label;

    struct CountingScraper;

    #[async_trait]
    impl Scraper for CountingScraper {
        async fn scrape(&self, target: &ScrapeTarget) -> Result<Vec<Sample>> {
            let mut labels = LabelSet::from([(METRIC_NAME_LABEL, "up")]);
            labels.insert("scraped_from", target.instance());
            Ok(vec![Sample::new(labels, 0, 1.0)])
        }
    }

    struct NullAppender;

    #[async_trait]
    impl Appender for NullAppender {
        fn append(&mut self, _sample: Sample) -> Result<()> {
            Ok(())
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            Ok(())
        }

        fn rollback(self: Box<Self>) {}
    }

    struct NullAppendable;

    impl Appendable for NullAppendable {
        fn appender(&self) -> Box<dyn Appender> {
            Box::new(NullAppender)
        }
    }

    fn manager(token: CancellationToken) -> ScrapeManager {
        ScrapeManager::new(Arc::new(NullAppendable), Arc::new(CountingScraper), token)
    }

    fn jobs(names: &[&str]) -> Vec<ScrapeJobConfig> {
        let mut jobs: Vec<ScrapeJobConfig> = names
            .iter()
            .map(|name| ScrapeJobConfig {
                scrape_interval: Duration::from_secs(3600),
                scrape_timeout: Duration::from_secs(5),
                ..ScrapeJobConfig::new(*name)
            })
            .collect();
        inject_scrape_job_label(&mut jobs);
        jobs
    }

    fn group(addresses: &[&str]) -> TargetGroup {
        TargetGroup {
            source: "test".into(),
            targets: addresses.iter().map(|a| LabelSet::from([(ADDRESS_LABEL, *a)])).collect(),
            labels: LabelSet::new(),
        }
    }

    #[test]
    fn invalid_config_keeps_previous_jobs() {
        let manager = manager(CancellationToken::new());
        manager.apply_config(&jobs(&["a"])).unwrap();

        let mut bad = jobs(&["b"]);
        bad[0].scrape_timeout = Duration::from_secs(7200);
        assert!(manager.apply_config(&bad).unwrap_err().is_config());
        assert!(manager.jobs.lock().contains_key("a"));
    }

    #[tokio::test]
    async fn reconcile_starts_and_stops_loops() {
        let manager = manager(CancellationToken::new());
        manager.apply_config(&jobs(&["a", "b"])).unwrap();

        manager.reconcile(&HashMap::from([
            ("a".to_string(), vec![group(&["h1:1", "h2:2"])]),
            ("b".to_string(), vec![group(&["h1:1"])]),
            ("unknown".to_string(), vec![group(&["h9:9"])]),
        ]));
        let targets = manager.active_targets();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].job, "a");
        assert_eq!(targets[0].instance, "h1:1");

        manager.reconcile(&HashMap::from([("a".to_string(), vec![group(&["h2:2"])])]));
        let targets = manager.active_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].labels.get(INSTANCE_LABEL), Some("h2:2"));

        manager.stop_all().await;
        assert!(manager.active_targets().is_empty());
    }

    #[tokio::test]
    async fn run_follows_discovery_until_cancelled() {
        let token = CancellationToken::new();
        let discovery = Arc::new(DiscoveryManager::new(token.clone()));
        discovery
            .apply_config(HashMap::from([(
                "a".to_string(),
                vec![DiscoveryConfig::Static(StaticConfig::new(["h1:1"]))],
            )]))
            .unwrap();
        let sync = discovery.take_sync_stream().unwrap();

        let scrape = Arc::new(manager(token.clone()));
        scrape.apply_config(&jobs(&["a"])).unwrap();

        let discovery_task = {
            let discovery = Arc::clone(&discovery);
            tokio::spawn(async move { discovery.run().await })
        };
        let scrape_task = {
            let scrape = Arc::clone(&scrape);
            tokio::spawn(async move { scrape.run(sync).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while scrape.active_targets().iter().all(|t| t.health != TargetHealth::Up) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        assert!(scrape_task.await.unwrap().is_ok());
        assert!(discovery_task.await.unwrap().is_ok());
        assert!(scrape.active_targets().is_empty());
    }

    #[tokio::test]
    async fn closed_sync_stream_is_an_error() {
        let discovery = DiscoveryManager::new(CancellationToken::new());
        let sync = discovery.take_sync_stream().unwrap();
        drop(discovery);

        let scrape = manager(CancellationToken::new());
        let err = scrape.run(sync).await.unwrap_err();
        assert!(matches!(err, ReceiverError::Scrape(_)));
    }
}
