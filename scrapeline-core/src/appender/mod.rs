//! Bridge between scrape loops and the downstream consumer.
//!
//! Every scrape cycle asks the [`Appendable`] for a fresh [`Appender`],
//! appends the samples it scraped and commits. The [`SampleBridge`] turns a
//! committed cycle into one [`MetricsBatch`], attaching start times with the
//! [`StartTimeStrategy`] chosen when the receiver started.

mod jobs_map;
mod start_time;

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use scrapeline_model::{
    INSTANCE_LABEL, JOB_LABEL, METRIC_NAME_LABEL, MetricPoint, MetricsBatch, SCRAPE_JOB_LABEL,
    Sample,
};
use tracing::{debug, warn};

use crate::consumer::MetricsConsumer;
use crate::error::{ReceiverError, Result};
use crate::scrape::{ScrapeManager, TargetStatus};

pub use jobs_map::{JobsMap, SeriesKey};
pub use start_time::StartTimeStrategy;

/// Hands out one [`Appender`] per scrape cycle.
pub trait Appendable: Send + Sync {
    fn appender(&self) -> Box<dyn Appender>;
}

/// A single scrape cycle's worth of samples.
///
/// Nothing reaches the consumer until [`Appender::commit`]; a cycle that is
/// abandoned calls [`Appender::rollback`] instead.
#[async_trait]
pub trait Appender: Send {
    fn append(&mut self, sample: Sample) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>);
}

pub struct SampleBridge {
    consumer: Arc<dyn MetricsConsumer>,
    strategy: StartTimeStrategy,
    receiver_name: Arc<str>,
    scrape_manager: OnceLock<Weak<ScrapeManager>>,
}

impl fmt::Debug for SampleBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleBridge")
            .field("receiver_name", &self.receiver_name)
            .field("strategy", &self.strategy)
            .field("scrape_manager_set", &self.scrape_manager.get().is_some())
            .finish()
    }
}

impl SampleBridge {
    pub fn new(
        consumer: Arc<dyn MetricsConsumer>,
        strategy: StartTimeStrategy,
        receiver_name: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            consumer,
            strategy,
            receiver_name: receiver_name.into(),
            scrape_manager: OnceLock::new(),
        }
    }

    /// Points the bridge back at the scrape manager that feeds it. The
    /// manager is built after the bridge, so this happens in a second step.
    /// Only the first call has an effect.
    pub fn set_scrape_manager(&self, manager: &Arc<ScrapeManager>) {
        if self.scrape_manager.set(Arc::downgrade(manager)).is_err() {
            warn!(target: "scrapeline::bridge", receiver = %self.receiver_name, "scrape manager already set");
        }
    }

    /// Live health of every scraped target. Empty until the scrape manager
    /// is set, and again once it is gone.
    pub fn target_statuses(&self) -> Vec<TargetStatus> {
        self.scrape_manager
            .get()
            .and_then(Weak::upgrade)
            .map(|manager| manager.active_targets())
            .unwrap_or_default()
    }

    pub fn strategy(&self) -> &StartTimeStrategy {
        &self.strategy
    }

    pub fn receiver_name(&self) -> &str {
        &self.receiver_name
    }
}

impl Appendable for SampleBridge {
    fn appender(&self) -> Box<dyn Appender> {
        Box::new(BridgeAppender {
            consumer: Arc::clone(&self.consumer),
            strategy: self.strategy.clone(),
            receiver_name: Arc::clone(&self.receiver_name),
            samples: Vec::new(),
        })
    }
}

struct BridgeAppender {
    consumer: Arc<dyn MetricsConsumer>,
    strategy: StartTimeStrategy,
    receiver_name: Arc<str>,
    samples: Vec<Sample>,
}

impl BridgeAppender {
    fn into_batch(self) -> Result<(Arc<dyn MetricsConsumer>, MetricsBatch)> {
        let first = &self.samples[0].labels;
        let job = first
            .get(SCRAPE_JOB_LABEL)
            .or_else(|| first.get(JOB_LABEL))
            .unwrap_or_default()
            .to_string();
        let instance = first.value(INSTANCE_LABEL).to_string();

        let series_start = self.strategy.batch_start_time(&job, &instance, &self.samples)?;

        let points = self
            .samples
            .into_iter()
            .map(|sample| {
                let start_timestamp_ms = match series_start {
                    Some(start) => Some(start),
                    None => self.strategy.series_start_time(&job, &instance, &sample),
                };
                let mut labels = sample.labels;
                let name = labels.remove(METRIC_NAME_LABEL).unwrap_or_default();
                MetricPoint {
                    name,
                    labels,
                    start_timestamp_ms,
                    timestamp_ms: sample.timestamp_ms,
                    value: sample.value,
                }
            })
            .collect();

        let batch = MetricsBatch {
            receiver: self.receiver_name.to_string(),
            job,
            instance,
            points,
        };
        Ok((self.consumer, batch))
    }
}

#[async_trait]
impl Appender for BridgeAppender {
    fn append(&mut self, sample: Sample) -> Result<()> {
        if sample.metric_name().is_none_or(str::is_empty) {
            return Err(ReceiverError::InvalidSample(format!(
                "sample without a metric name: {}",
                sample.labels
            )));
        }
        self.samples.push(sample);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.samples.is_empty() {
            return Ok(());
        }
        let (consumer, batch) = self.into_batch()?;
        debug!(
            target: "scrapeline::bridge",
            receiver = %batch.receiver,
            job = %batch.job,
            instance = %batch.instance,
            points = batch.len(),
            "committing scrape"
        );
        consumer.consume_metrics(batch).await
    }

    fn rollback(self: Box<Self>) {
        debug!(target: "scrapeline::bridge", discarded = self.samples.len(), "scrape rolled back");
    }
}
