//! Target discovery.
//!
//! The [`DiscoveryManager`] owns one provider per configured discovery
//! entry, merges their updates into a per-job table of target groups and
//! publishes that table on a single-consumer [`SyncStream`].

mod file;
mod static_sd;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use scrapeline_model::{TargetGroup, TargetSets};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ReceiverError, Result};

pub use file::{FileDiscoverer, FileSdConfig};
pub use static_sd::{StaticConfig, StaticDiscoverer};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// One discovery mechanism for a scrape job.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryConfig {
    Static(StaticConfig),
    File(FileSdConfig),
    /// Provider supplied in code; cannot be expressed in TOML.
    #[serde(skip)]
    Custom(CustomDiscovery),
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            DiscoveryConfig::Static(cfg) => cfg.validate(),
            DiscoveryConfig::File(cfg) => cfg.validate(),
            DiscoveryConfig::Custom(custom) => custom.factory.validate(),
        }
    }

    fn build(&self) -> Result<Box<dyn Discoverer>> {
        self.validate()?;
        Ok(match self {
            DiscoveryConfig::Static(cfg) => Box::new(StaticDiscoverer::new(cfg.clone())),
            DiscoveryConfig::File(cfg) => Box::new(FileDiscoverer::new(cfg.clone())),
            DiscoveryConfig::Custom(custom) => custom.factory.build()?,
        })
    }

    fn kind(&self) -> &str {
        match self {
            DiscoveryConfig::Static(_) => "static",
            DiscoveryConfig::File(_) => "file",
            DiscoveryConfig::Custom(custom) => custom.factory.name(),
        }
    }
}

/// Builds a [`Discoverer`] for [`DiscoveryConfig::Custom`].
pub trait DiscovererFactory: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn build(&self) -> Result<Box<dyn Discoverer>>;
}

#[derive(Clone)]
pub struct CustomDiscovery {
    factory: Arc<dyn DiscovererFactory>,
}

impl CustomDiscovery {
    pub fn new(factory: Arc<dyn DiscovererFactory>) -> Self {
        Self { factory }
    }
}

impl fmt::Debug for CustomDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomDiscovery")
            .field("name", &self.factory.name())
            .finish()
    }
}

/// A running discovery provider.
///
/// Providers push full or partial target group lists; a group replaces any
/// earlier group with the same `source` from the same provider. Returning an
/// error is treated as unrecoverable for the whole receiver, so providers
/// are expected to retry transient failures themselves.
#[async_trait]
pub trait Discoverer: Send {
    async fn run(self: Box<Self>, shutdown: CancellationToken, updates: TargetUpdates) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ProviderKey {
    job: String,
    index: usize,
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job, self.index)
    }
}

/// Sending half handed to a [`Discoverer`].
#[derive(Clone, Debug)]
pub struct TargetUpdates {
    key: ProviderKey,
    tx: mpsc::Sender<(ProviderKey, Vec<TargetGroup>)>,
}

impl TargetUpdates {
    /// Publishes groups. Fails only once the manager has stopped listening.
    pub async fn send(&self, groups: Vec<TargetGroup>) -> Result<()> {
        self.tx
            .send((self.key.clone(), groups))
            .await
            .map_err(|_| ReceiverError::Discovery(format!("provider {} outlived its manager", self.key)))
    }

    pub fn job(&self) -> &str {
        &self.key.job
    }
}

/// The receiving end of discovery. Yields the full per-job target table
/// every time it changes; intermediate states may be skipped.
#[derive(Debug)]
pub struct SyncStream {
    rx: watch::Receiver<TargetSets>,
}

impl SyncStream {
    /// Waits for the next target table. Returns `None` once the discovery
    /// manager is gone.
    pub async fn next(&mut self) -> Option<TargetSets> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

struct Provider {
    key: ProviderKey,
    kind: String,
    discoverer: Box<dyn Discoverer>,
}

/// Runs discovery providers and publishes their merged results.
pub struct DiscoveryManager {
    shutdown: CancellationToken,
    providers: Mutex<Vec<Provider>>,
    jobs: Mutex<Vec<String>>,
    sync_tx: watch::Sender<TargetSets>,
    sync_rx: Mutex<Option<watch::Receiver<TargetSets>>>,
}

impl fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("providers", &self.providers.lock().len())
            .field("jobs", &*self.jobs.lock())
            .field("sync_stream_taken", &self.sync_rx.lock().is_none())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl DiscoveryManager {
    pub fn new(shutdown: CancellationToken) -> Self {
        let (sync_tx, sync_rx) = watch::channel(TargetSets::new());
        Self {
            shutdown,
            providers: Mutex::new(Vec::new()),
            jobs: Mutex::new(Vec::new()),
            sync_tx,
            sync_rx: Mutex::new(Some(sync_rx)),
        }
    }

    /// Validates and installs discovery configuration keyed by job name.
    /// Nothing is installed if any entry is invalid.
    pub fn apply_config(&self, configs: HashMap<String, Vec<DiscoveryConfig>>) -> Result<()> {
        let mut providers = Vec::new();
        let mut jobs: Vec<String> = configs.keys().cloned().collect();
        jobs.sort();

        for (job, entries) in &configs {
            for (index, entry) in entries.iter().enumerate() {
                let discoverer = entry.build().map_err(|err| {
                    let reason = match err {
                        ReceiverError::Config(msg) => msg,
                        other => other.to_string(),
                    };
                    ReceiverError::Config(format!("job {job:?} discovery #{index}: {reason}"))
                })?;
                providers.push(Provider {
                    key: ProviderKey {
                        job: job.clone(),
                        index,
                    },
                    kind: entry.kind().to_string(),
                    discoverer,
                });
            }
        }

        debug!(
            target: "scrapeline::discovery",
            jobs = jobs.len(),
            providers = providers.len(),
            "discovery configuration applied"
        );
        *self.providers.lock() = providers;
        *self.jobs.lock() = jobs;
        Ok(())
    }

    /// Hands out the sync stream. There is exactly one; later calls return
    /// `None`.
    pub fn take_sync_stream(&self) -> Option<SyncStream> {
        self.sync_rx.lock().take().map(|rx| SyncStream { rx })
    }

    /// Runs all providers until the shutdown token is cancelled.
    ///
    /// Returns `Ok(())` on cancellation and an error when any provider
    /// fails.
    pub async fn run(&self) -> Result<()> {
        let providers = std::mem::take(&mut *self.providers.lock());
        let mut table: HashMap<String, HashMap<usize, Vec<TargetGroup>>> = self
            .jobs
            .lock()
            .iter()
            .map(|job| (job.clone(), HashMap::new()))
            .collect();

        let (tx, mut rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let mut tasks = JoinSet::new();
        for provider in providers {
            let Provider {
                key,
                kind,
                discoverer,
            } = provider;
            debug!(target: "scrapeline::discovery", provider = %key, kind = %kind, "starting provider");
            let updates = TargetUpdates {
                key: key.clone(),
                tx: tx.clone(),
            };
            let token = self.shutdown.child_token();
            tasks.spawn(async move {
                let result = discoverer.run(token, updates).await;
                (key, result)
            });
        }
        drop(tx);

        info!(target: "scrapeline::discovery", providers = tasks.len(), "discovery manager running");

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                Some((key, groups)) = rx.recv() => {
                    merge_update(&mut table, &key, groups);
                    self.sync_tx.send_replace(flatten(&table));
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok((key, Ok(()))) => {
                        debug!(target: "scrapeline::discovery", provider = %key, "provider finished");
                    }
                    Ok((key, Err(err))) => {
                        error!(target: "scrapeline::discovery", provider = %key, error = %err, "provider failed");
                        break Err(ReceiverError::Discovery(format!("provider {key}: {err}")));
                    }
                    Err(join_err) => {
                        break Err(ReceiverError::Discovery(format!("provider task aborted: {join_err}")));
                    }
                },
            }
        };

        tasks.shutdown().await;
        info!(target: "scrapeline::discovery", "discovery manager stopped");
        outcome
    }
}

fn merge_update(
    table: &mut HashMap<String, HashMap<usize, Vec<TargetGroup>>>,
    key: &ProviderKey,
    groups: Vec<TargetGroup>,
) {
    let existing = table
        .entry(key.job.clone())
        .or_default()
        .entry(key.index)
        .or_default();

    for group in groups {
        match existing.iter_mut().find(|g| g.source == group.source) {
            Some(slot) => *slot = group,
            None => existing.push(group),
        }
    }
    existing.retain(|group| !group.is_empty());
}

fn flatten(table: &HashMap<String, HashMap<usize, Vec<TargetGroup>>>) -> TargetSets {
    table
        .iter()
        .map(|(job, providers)| {
            let mut indices: Vec<&usize> = providers.keys().collect();
            indices.sort();
            let groups = indices
                .into_iter()
                .flat_map(|index| providers[index].iter().cloned())
                .collect();
            (job.clone(), groups)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use scrapeline_model::{ADDRESS_LABEL, LabelSet};

    use super::*;

    struct FailingDiscoverer;

    #[async_trait]
    impl Discoverer for FailingDiscoverer {
        async fn run(self: Box<Self>, _shutdown: CancellationToken, _updates: TargetUpdates) -> Result<()> {
            Err(ReceiverError::Discovery("registry unreachable".into()))
        }
    }

    struct FailingFactory;

    impl DiscovererFactory for FailingFactory {
        fn name(&self) -> &str {
            "failing"
        }

        fn build(&self) -> Result<Box<dyn Discoverer>> {
            Ok(Box::new(FailingDiscoverer))
        }
    }

    fn static_config(targets: &[&str]) -> DiscoveryConfig {
        DiscoveryConfig::Static(StaticConfig {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            labels: LabelSet::new(),
        })
    }

    #[tokio::test]
    async fn publishes_static_targets_per_job() {
        let token = CancellationToken::new();
        let manager = Arc::new(DiscoveryManager::new(token.clone()));
        manager
            .apply_config(HashMap::from([
                ("a".to_string(), vec![static_config(&["host-1:9100"])]),
                ("b".to_string(), vec![static_config(&["host-1:9100", "host-2:9100"])]),
            ]))
            .unwrap();
        let mut sync = manager.take_sync_stream().unwrap();
        assert!(manager.take_sync_stream().is_none());

        let runner = Arc::clone(&manager);
        let handle = tokio::spawn(async move { runner.run().await });

        let sets = loop {
            let sets = tokio::time::timeout(Duration::from_secs(5), sync.next())
                .await
                .unwrap()
                .unwrap();
            if sets.values().all(|groups| !groups.is_empty()) {
                break sets;
            }
        };

        let addresses = |job: &str| -> Vec<String> {
            sets[job]
                .iter()
                .flat_map(|g| g.targets.iter())
                .map(|t| t.value(ADDRESS_LABEL).to_string())
                .collect()
        };
        assert_eq!(addresses("a"), vec!["host-1:9100"]);
        assert_eq!(addresses("b"), vec!["host-1:9100", "host-2:9100"]);

        token.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn invalid_config_installs_nothing() {
        let manager = DiscoveryManager::new(CancellationToken::new());
        let err = manager
            .apply_config(HashMap::from([(
                "bad".to_string(),
                vec![static_config(&["ok:1"]), static_config(&["not a target"])],
            )]))
            .unwrap_err();

        assert!(err.is_config());
        assert!(manager.providers.lock().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_ends_run_with_error() {
        let manager = DiscoveryManager::new(CancellationToken::new());
        manager
            .apply_config(HashMap::from([(
                "broken".to_string(),
                vec![DiscoveryConfig::Custom(CustomDiscovery::new(Arc::new(FailingFactory)))],
            )]))
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), manager.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Discovery(_)));
        assert!(err.to_string().contains("registry unreachable"));
    }

    #[tokio::test]
    async fn run_without_providers_waits_for_cancellation() {
        let token = CancellationToken::new();
        let manager = Arc::new(DiscoveryManager::new(token.clone()));
        manager.apply_config(HashMap::new()).unwrap();

        let runner = Arc::clone(&manager);
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        token.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[test]
    fn later_groups_replace_earlier_ones_by_source() {
        let key = ProviderKey {
            job: "a".into(),
            index: 0,
        };
        let mut table = HashMap::new();
        let group = |source: &str, addrs: &[&str]| TargetGroup {
            source: source.into(),
            targets: addrs.iter().map(|a| LabelSet::from([(ADDRESS_LABEL, *a)])).collect(),
            labels: LabelSet::new(),
        };

        merge_update(&mut table, &key, vec![group("x", &["1:1"]), group("y", &["2:2"])]);
        merge_update(&mut table, &key, vec![group("x", &["3:3"]), group("y", &[])]);

        let sets = flatten(&table);
        assert_eq!(sets["a"].len(), 1);
        assert_eq!(sets["a"][0].targets[0].value(ADDRESS_LABEL), "3:3");
    }
}
