use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use scrapeline_model::{LabelSet, SCRAPE_JOB_LABEL, Sample};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::target::{ScrapeTarget, TargetHealth, TargetStatus};
use super::Scraper;
use crate::appender::Appendable;
use crate::config::ScrapeJobConfig;
use crate::error::{ReceiverError, Result};
use crate::relabel;

const EXPORTED_LABEL_PREFIX: &str = "exported_";

/// Scrapes one target on the job interval until cancelled.
pub(super) struct ScrapeLoop {
    pub(super) job: Arc<ScrapeJobConfig>,
    pub(super) target: ScrapeTarget,
    pub(super) scraper: Arc<dyn Scraper>,
    pub(super) appendable: Arc<dyn Appendable>,
    pub(super) status: Arc<Mutex<TargetStatus>>,
    pub(super) shutdown: CancellationToken,
}

impl ScrapeLoop {
    pub(super) async fn run(self) {
        debug!(target: "scrapeline::scrape", job = %self.target.job, url = %self.target.url, "scrape loop started");

        let mut ticker = tokio::time::interval(self.target.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.scrape_once().await;
        }

        debug!(target: "scrapeline::scrape", job = %self.target.job, url = %self.target.url, "scrape loop stopped");
    }

    async fn scrape_once(&self) {
        let scrape_time = SystemTime::now();
        let started = Instant::now();

        let scraped = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            result = tokio::time::timeout(self.target.timeout, self.scraper.scrape(&self.target)) => {
                result.unwrap_or_else(|_| {
                    Err(ReceiverError::ScrapeTarget {
                        target: self.target.url.to_string(),
                        reason: format!("timed out after {}", humantime::format_duration(self.target.timeout)),
                    })
                })
            }
        };

        let outcome = match scraped {
            Ok(samples) => self.append(samples, unix_millis(scrape_time)).await,
            Err(err) => Err(err),
        };
        if self.shutdown.is_cancelled() {
            return;
        }
        self.record(scrape_time, started, outcome);
    }

    async fn append(&self, samples: Vec<Sample>, scrape_ms: i64) -> Result<usize> {
        let mut appender = self.appendable.appender();
        let mut appended = 0;
        for sample in samples {
            let Some(sample) = self.process_sample(sample, scrape_ms) else {
                continue;
            };
            if let Err(err) = appender.append(sample) {
                appender.rollback();
                return Err(err);
            }
            appended += 1;
        }

        if self.shutdown.is_cancelled() {
            appender.rollback();
            return Ok(0);
        }
        // A slow consumer must not hold up shutdown. Dropping the commit
        // future abandons the batch.
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!(target: "scrapeline::scrape", job = %self.target.job, url = %self.target.url, "commit abandoned on shutdown");
                Ok(0)
            }
            committed = appender.commit() => committed.map(|()| appended),
        }
    }

    /// Attaches target labels, applies metric relabeling and fills in the
    /// scrape timestamp. Returns `None` for samples that are dropped.
    fn process_sample(&self, sample: Sample, scrape_ms: i64) -> Option<Sample> {
        let merged = merge_target_labels(sample.labels, &self.target.labels, self.job.honor_labels);

        let mut labels = relabel::process(&merged, &self.job.metric_relabel_configs)?;
        labels.metric_name()?;
        // Attribution always comes from the target, whatever was scraped.
        match self.target.labels.get(SCRAPE_JOB_LABEL) {
            Some(job) => {
                labels.insert(SCRAPE_JOB_LABEL, job);
            }
            None => {
                labels.remove(SCRAPE_JOB_LABEL);
            }
        }

        let timestamp_ms = if sample.timestamp_ms > 0 {
            sample.timestamp_ms
        } else {
            scrape_ms
        };
        Some(Sample::new(labels, timestamp_ms, sample.value))
    }

    fn record(&self, scrape_time: SystemTime, started: Instant, outcome: Result<usize>) {
        let duration = started.elapsed();
        if let Err(err) = &outcome {
            warn!(
                target: "scrapeline::scrape",
                job = %self.target.job,
                url = %self.target.url,
                error = %err,
                "scrape failed"
            );
        }

        let mut status = self.status.lock();
        status.last_scrape = Some(scrape_time);
        status.last_duration = Some(duration);
        match outcome {
            Ok(samples) => {
                status.health = TargetHealth::Up;
                status.last_error = None;
                status.samples_scraped = samples;
            }
            Err(err) => {
                status.health = TargetHealth::Down;
                status.last_error = Some(err.to_string());
                status.samples_scraped = 0;
            }
        }
    }
}

/// Adds the target's labels to a scraped label set.
///
/// With `honor_labels` scraped values win. Otherwise target values win and a
/// conflicting scraped label is kept as `exported_<name>`. Empty values are
/// removed.
fn merge_target_labels(mut scraped: LabelSet, target: &LabelSet, honor_labels: bool) -> LabelSet {
    for (name, value) in target.iter() {
        match scraped.get(name) {
            None => {
                scraped.insert(name, value);
            }
            Some(_) if honor_labels => {}
            Some(existing) if existing == value => {}
            Some(_) => {
                let mut exported = format!("{EXPORTED_LABEL_PREFIX}{name}");
                while scraped.contains(&exported) {
                    exported.insert_str(0, EXPORTED_LABEL_PREFIX);
                }
                if let Some(existing) = scraped.insert(name, value) {
                    scraped.insert(exported, existing);
                }
            }
        }
    }
    scraped.retain(|_, value| !value.is_empty());
    scraped
}

fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
