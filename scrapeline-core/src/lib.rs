//! A Prometheus-style scrape receiver run as a managed background service.
//!
//! [`MetricsReceiver`] discovers targets, scrapes them on a schedule and
//! pushes every committed scrape to a [`MetricsConsumer`] as a
//! [`MetricsBatch`](scrapeline_model::MetricsBatch). Every target is
//! stamped with the name of its scrape job in a reserved label
//! ([`SCRAPE_JOB_LABEL`](scrapeline_model::SCRAPE_JOB_LABEL)) so samples can
//! be attributed after arbitrary user relabeling.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use scrapeline_core::{ChannelConsumer, FatalErrorSignal, MetricsReceiver, ReceiverConfig, Scraper};
//!
//! # async fn run(scraper: Arc<dyn Scraper>) -> scrapeline_core::Result<()> {
//! let config = ReceiverConfig::load("scrapeline.toml")?;
//! let (consumer, mut batches) = ChannelConsumer::new(64);
//! let (host, fatal) = FatalErrorSignal::new();
//!
//! let receiver = MetricsReceiver::new(config, Arc::new(consumer), scraper);
//! receiver.start(Arc::new(host))?;
//!
//! tokio::select! {
//!     Ok(err) = fatal => eprintln!("receiver failed: {err}"),
//!     _ = async { while let Some(batch) = batches.recv().await { println!("{}: {} points", batch.job, batch.len()); } } => {}
//! }
//! receiver.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]

pub mod appender;
pub mod config;
pub mod consumer;
pub mod discovery;
pub mod error;
pub mod host;
pub mod receiver;
pub mod relabel;
pub mod scrape;

pub use appender::{Appendable, Appender, JobsMap, SampleBridge, StartTimeStrategy};
pub use config::{ReceiverConfig, ScrapeJobConfig};
pub use consumer::{ChannelConsumer, MetricsConsumer};
pub use discovery::{
    CustomDiscovery, Discoverer, DiscovererFactory, DiscoveryConfig, DiscoveryManager, SyncStream,
    TargetUpdates,
};
pub use error::{ReceiverError, Result};
pub use host::{FatalErrorSignal, Host};
pub use receiver::{MetricsReceiver, ReceiverState};
pub use relabel::{RelabelAction, RelabelConfig, inject_scrape_job_label};
pub use scrape::{ScrapeManager, ScrapeTarget, Scraper, TargetHealth, TargetStatus};
