//! The managed receiver: wires discovery, scraping and the sample bridge
//! together under one cancellation token.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

use crate::appender::{SampleBridge, StartTimeStrategy};
use crate::config::ReceiverConfig;
use crate::consumer::MetricsConsumer;
use crate::discovery::DiscoveryManager;
use crate::error::{ReceiverError, Result};
use crate::host::Host;
use crate::relabel::inject_scrape_job_label;
use crate::scrape::{ScrapeManager, Scraper, TargetStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReceiverState::Created => "created",
            ReceiverState::Starting => "starting",
            ReceiverState::Running => "running",
            ReceiverState::ShuttingDown => "shutting down",
            ReceiverState::Stopped => "stopped",
        })
    }
}

struct Inner {
    state: ReceiverState,
    shutdown: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    // Held so the sync stream stays open for as long as the receiver runs,
    // even if the discovery loop itself has exited.
    discovery: Option<Arc<DiscoveryManager>>,
    bridge: Option<Arc<SampleBridge>>,
}

/// A scrape receiver running as a background service.
///
/// [`start`](Self::start) validates the configuration, launches discovery
/// and scraping and returns without waiting for either.
/// [`shutdown`](Self::shutdown) cancels both and returns without waiting
/// for them to exit. Failures of the background loops are reported to the
/// [`Host`] passed to `start`.
pub struct MetricsReceiver {
    name: String,
    config: Mutex<ReceiverConfig>,
    consumer: Arc<dyn MetricsConsumer>,
    scraper: Arc<dyn Scraper>,
    inner: Mutex<Inner>,
    /// Count of supervised tasks that have not exited yet.
    running: watch::Sender<usize>,
}

impl fmt::Debug for MetricsReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MetricsReceiver")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("tasks", &inner.tasks.len())
            .finish()
    }
}

impl MetricsReceiver {
    pub fn new(
        config: ReceiverConfig,
        consumer: Arc<dyn MetricsConsumer>,
        scraper: Arc<dyn Scraper>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            config: Mutex::new(config),
            consumer,
            scraper,
            inner: Mutex::new(Inner {
                state: ReceiverState::Created,
                shutdown: None,
                tasks: Vec::new(),
                discovery: None,
                bridge: None,
            }),
            running: watch::Sender::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ReceiverState {
        self.inner.lock().state
    }

    /// Current configuration, including the rules injected by `start`.
    pub fn config(&self) -> ReceiverConfig {
        self.config.lock().clone()
    }

    /// Starts discovery and scraping on the current tokio runtime.
    ///
    /// Both subsystems are configured before anything is spawned, so a
    /// configuration error is returned here and leaves nothing running. The
    /// receiver is then `Stopped` and cannot be started again.
    pub fn start(&self, host: Arc<dyn Host>) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|err| ReceiverError::Internal(format!("receiver must start inside a tokio runtime: {err}")))?;

        let mut inner = self.inner.lock();
        if inner.state != ReceiverState::Created {
            return Err(ReceiverError::InvalidState {
                expected: ReceiverState::Created,
                actual: inner.state,
            });
        }
        inner.state = ReceiverState::Starting;
        info!(target: "scrapeline::receiver", receiver = %self.name, "starting receiver");

        // Never derived from a caller's token: the receiver outlives whatever
        // request started it.
        let token = CancellationToken::new();
        let wired = match self.wire(&token) {
            Ok(wired) => wired,
            Err(err) => {
                token.cancel();
                inner.state = ReceiverState::Stopped;
                error!(target: "scrapeline::receiver", receiver = %self.name, error = %err, "receiver failed to start");
                return Err(err);
            }
        };

        let Wired {
            discovery,
            scrape,
            bridge,
            sync,
        } = wired;

        let discovery_run = Arc::clone(&discovery);
        let span = info_span!(target: "scrapeline::receiver", "discovery", receiver = %self.name);
        inner.tasks.push(spawn_supervised(
            &runtime,
            "discovery",
            Arc::clone(&host),
            &self.running,
            async move { discovery_run.run().await }.instrument(span),
        ));

        let span = info_span!(target: "scrapeline::receiver", "scrape", receiver = %self.name);
        inner.tasks.push(spawn_supervised(
            &runtime,
            "scrape",
            host,
            &self.running,
            async move { scrape.run(sync).await }.instrument(span),
        ));

        inner.shutdown = Some(token);
        inner.discovery = Some(discovery);
        inner.bridge = Some(bridge);
        inner.state = ReceiverState::Running;
        info!(target: "scrapeline::receiver", receiver = %self.name, "receiver running");
        Ok(())
    }

    /// Builds and configures the subsystems without spawning anything.
    fn wire(&self, token: &CancellationToken) -> Result<Wired> {
        let mut config = self.config.lock();
        inject_scrape_job_label(&mut config.scrape_configs);

        let discovery = Arc::new(DiscoveryManager::new(token.clone()));
        discovery.apply_config(config.discovery_configs())?;

        let strategy = StartTimeStrategy::from_config(&config)?;
        debug!(target: "scrapeline::receiver", receiver = %self.name, strategy = ?strategy, "start time strategy selected");
        let bridge = Arc::new(SampleBridge::new(
            Arc::clone(&self.consumer),
            strategy,
            self.name.as_str(),
        ));

        let scrape = Arc::new(ScrapeManager::new(
            Arc::clone(&bridge) as _,
            Arc::clone(&self.scraper),
            token.clone(),
        ));
        bridge.set_scrape_manager(&scrape);
        scrape.apply_config(&config.scrape_configs)?;

        let sync = discovery
            .take_sync_stream()
            .ok_or_else(|| ReceiverError::Internal("discovery sync stream already taken".into()))?;

        Ok(Wired {
            discovery,
            scrape,
            bridge,
            sync,
        })
    }

    /// Cancels the background loops and returns without waiting for them.
    /// Calling it again, or before `start`, is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            ReceiverState::Stopped => {
                debug!(target: "scrapeline::receiver", receiver = %self.name, "receiver already stopped");
                return Ok(());
            }
            ReceiverState::Created => {
                inner.state = ReceiverState::Stopped;
                return Ok(());
            }
            _ => {}
        }

        inner.state = ReceiverState::ShuttingDown;
        if let Some(token) = inner.shutdown.take() {
            token.cancel();
        }
        inner.discovery = None;
        inner.state = ReceiverState::Stopped;
        info!(target: "scrapeline::receiver", receiver = %self.name, "receiver shut down");
        Ok(())
    }

    /// Number of background loops that have not exited yet.
    pub fn active_tasks(&self) -> usize {
        self.inner
            .lock()
            .tasks
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Waits for the background loops to exit. Only returns once they have
    /// been cancelled or have failed.
    ///
    /// Dropping the returned future early leaves the receiver untouched, so
    /// it can be awaited again under a timeout.
    pub async fn wait_stopped(&self) {
        let mut running = self.running.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = running.wait_for(|count| *count == 0).await;
        debug!(target: "scrapeline::receiver", receiver = %self.name, "background tasks stopped");
    }

    /// Health of every target currently being scraped.
    pub fn target_statuses(&self) -> Vec<TargetStatus> {
        let bridge = self.inner.lock().bridge.clone();
        bridge.map(|bridge| bridge.target_statuses()).unwrap_or_default()
    }
}

impl Drop for MetricsReceiver {
    fn drop(&mut self) {
        if let Some(token) = self.inner.get_mut().shutdown.take() {
            token.cancel();
        }
    }
}

struct Wired {
    discovery: Arc<DiscoveryManager>,
    scrape: Arc<ScrapeManager>,
    bridge: Arc<SampleBridge>,
    sync: crate::discovery::SyncStream,
}

/// Decrements the running count when the supervising task ends, however it
/// ends.
struct RunningTask(watch::Sender<usize>);

impl RunningTask {
    fn enter(running: &watch::Sender<usize>) -> Self {
        running.send_modify(|count| *count += 1);
        Self(running.clone())
    }
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Spawns `fut` and a watcher that reports its failure to `host`.
///
/// A clean exit reports nothing. An error is forwarded as is and a panic as
/// [`ReceiverError::TaskPanicked`].
fn spawn_supervised<F>(
    runtime: &Handle,
    task: &'static str,
    host: Arc<dyn Host>,
    running: &watch::Sender<usize>,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let guard = RunningTask::enter(running);
    let inner = runtime.spawn(fut);
    runtime.spawn(async move {
        let _guard = guard;
        let err = match inner.await {
            Ok(Ok(())) => {
                debug!(target: "scrapeline::receiver", task, "background task finished");
                return;
            }
            Ok(Err(err)) => err,
            Err(join_err) if join_err.is_panic() => ReceiverError::TaskPanicked { task },
            Err(join_err) => {
                debug!(target: "scrapeline::receiver", task, error = %join_err, "background task cancelled");
                return;
            }
        };
        error!(target: "scrapeline::receiver", task, error = %err, "background task failed");
        host.report_fatal_error(err);
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use scrapeline_model::{SCRAPE_JOB_LABEL, Sample};
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::ScrapeJobConfig;
    use crate::consumer::ChannelConsumer;
    use crate::discovery::{
        CustomDiscovery, Discoverer, DiscovererFactory, DiscoveryConfig, StaticConfig, TargetUpdates,
    };
    use crate::host::MockHost;
    use crate::scrape::ScrapeTarget;

    struct EmptyScraper;

    #[async_trait]
    impl Scraper for EmptyScraper {
        async fn scrape(&self, _target: &ScrapeTarget) -> Result<Vec<Sample>> {
            Ok(Vec::new())
        }
    }

    struct BrokenRegistry;

    #[async_trait]
    impl Discoverer for BrokenRegistry {
        async fn run(self: Box<Self>, _shutdown: CancellationToken, _updates: TargetUpdates) -> Result<()> {
            Err(ReceiverError::Discovery("registry unreachable".into()))
        }
    }

    impl DiscovererFactory for BrokenRegistry {
        fn name(&self) -> &str {
            "broken"
        }

        fn build(&self) -> Result<Box<dyn Discoverer>> {
            Ok(Box::new(BrokenRegistry))
        }
    }

    fn config(discovery: DiscoveryConfig) -> ReceiverConfig {
        ReceiverConfig {
            name: "prometheus/test".into(),
            scrape_configs: vec![ScrapeJobConfig {
                discovery: vec![discovery],
                ..ScrapeJobConfig::new("node")
            }],
            ..ReceiverConfig::default()
        }
    }

    fn receiver(config: ReceiverConfig) -> MetricsReceiver {
        let (consumer, _rx) = ChannelConsumer::new(16);
        MetricsReceiver::new(config, Arc::new(consumer), Arc::new(EmptyScraper))
    }

    fn quiet_host() -> Arc<dyn Host> {
        let mut host = MockHost::new();
        host.expect_report_fatal_error().times(0);
        Arc::new(host)
    }

    #[tokio::test]
    async fn clean_lifecycle_reports_nothing() {
        let receiver = receiver(config(DiscoveryConfig::Static(StaticConfig::new(["h1:9100"]))));
        assert_eq!(receiver.state(), ReceiverState::Created);

        receiver.start(quiet_host()).unwrap();
        assert_eq!(receiver.state(), ReceiverState::Running);
        assert_eq!(receiver.active_tasks(), 2);

        let rules = &receiver.config().scrape_configs[0].relabel_configs;
        assert_eq!(rules.last().map(|rule| rule.target_label.as_str()), Some(SCRAPE_JOB_LABEL));

        receiver.shutdown().unwrap();
        assert_eq!(receiver.state(), ReceiverState::Stopped);
        tokio::time::timeout(Duration::from_secs(5), receiver.wait_stopped())
            .await
            .unwrap();
        assert_eq!(receiver.active_tasks(), 0);
    }

    #[tokio::test]
    async fn discovery_failure_is_reported_to_host() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = MockHost::new();
        host.expect_report_fatal_error()
            .times(1)
            .returning(move |err| {
                let _ = tx.send(err.to_string());
            });

        let receiver = receiver(config(DiscoveryConfig::Custom(CustomDiscovery::new(Arc::new(BrokenRegistry)))));
        receiver.start(Arc::new(host)).unwrap();

        let reported = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reported.contains("registry unreachable"));

        receiver.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), receiver.wait_stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn panicking_loop_is_reported_as_panic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = MockHost::new();
        host.expect_report_fatal_error()
            .times(1)
            .returning(move |err| {
                let _ = tx.send(err);
            });

        fn explode() -> Result<()> {
            panic!("boom")
        }

        let running = watch::Sender::new(0);
        let handle = spawn_supervised(&Handle::current(), "scrape", Arc::new(host), &running, async { explode() });
        handle.await.unwrap();
        assert_eq!(*running.borrow(), 0);

        let err = rx.recv().await.unwrap();
        assert!(matches!(err, ReceiverError::TaskPanicked { task: "scrape" }));
    }

    #[tokio::test]
    async fn timed_out_wait_keeps_tasks_tracked() {
        let receiver = receiver(config(DiscoveryConfig::Static(StaticConfig::new(["h1:9100"]))));
        receiver.start(quiet_host()).unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(50), receiver.wait_stopped()).await;
        assert!(waited.is_err());
        assert_eq!(receiver.active_tasks(), 2);

        receiver.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), receiver.wait_stopped())
            .await
            .unwrap();
        assert_eq!(receiver.active_tasks(), 0);
    }

    #[tokio::test]
    async fn wait_before_start_returns_immediately() {
        let receiver = receiver(ReceiverConfig::default());
        tokio::time::timeout(Duration::from_secs(1), receiver.wait_stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let receiver = receiver(config(DiscoveryConfig::Static(StaticConfig::new(["h1:9100"]))));
        receiver.start(quiet_host()).unwrap();

        let err = receiver.start(quiet_host()).unwrap_err();
        assert!(matches!(
            err,
            ReceiverError::InvalidState {
                expected: ReceiverState::Created,
                actual: ReceiverState::Running
            }
        ));
        receiver.shutdown().unwrap();
    }

    #[tokio::test]
    async fn invalid_start_time_regex_fails_start() {
        let mut config = config(DiscoveryConfig::Static(StaticConfig::new(["h1:9100"])));
        config.use_start_time_metric = true;
        config.start_time_metric_regex = Some("(".into());
        let receiver = receiver(config);

        assert!(receiver.start(quiet_host()).unwrap_err().is_config());
        assert_eq!(receiver.state(), ReceiverState::Stopped);
        assert_eq!(receiver.active_tasks(), 0);
    }

    #[test]
    fn start_outside_runtime_is_an_error() {
        let receiver = receiver(ReceiverConfig::default());
        let err = receiver.start(quiet_host()).unwrap_err();

        assert!(matches!(err, ReceiverError::Internal(_)));
        assert_eq!(receiver.state(), ReceiverState::Created);
    }

    #[test]
    fn shutdown_before_start_stops() {
        let receiver = receiver(ReceiverConfig::default());
        receiver.shutdown().unwrap();
        receiver.shutdown().unwrap();
        assert_eq!(receiver.state(), ReceiverState::Stopped);
        assert!(receiver.target_statuses().is_empty());
    }
}
