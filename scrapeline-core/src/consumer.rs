//! The downstream side of the receiver.

use async_trait::async_trait;
use scrapeline_model::MetricsBatch;
use tokio::sync::mpsc;

use crate::error::{ReceiverError, Result};

/// Accepts committed scrapes. Called once per successful scrape of a target.
#[async_trait]
pub trait MetricsConsumer: Send + Sync {
    async fn consume_metrics(&self, batch: MetricsBatch) -> Result<()>;
}

/// Forwards batches into a bounded channel.
///
/// Back-pressure from a slow reader delays the scrape loop that produced the
/// batch, never the other targets.
#[derive(Debug, Clone)]
pub struct ChannelConsumer {
    tx: mpsc::Sender<MetricsBatch>,
}

impl ChannelConsumer {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MetricsBatch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MetricsConsumer for ChannelConsumer {
    async fn consume_metrics(&self, batch: MetricsBatch) -> Result<()> {
        self.tx
            .send(batch)
            .await
            .map_err(|_| ReceiverError::Consumer("metrics channel closed".into()))
    }
}
