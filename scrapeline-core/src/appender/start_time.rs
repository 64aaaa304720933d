use std::sync::Arc;

use regex::Regex;
use scrapeline_model::Sample;

use super::jobs_map::{JobsMap, SeriesKey};
use crate::config::ReceiverConfig;
use crate::error::{ReceiverError, Result};

/// Where a series' start time comes from. Chosen once per receiver.
#[derive(Clone, Debug)]
pub enum StartTimeStrategy {
    /// First time the series was seen, remembered in a side table.
    JobsMap(Arc<JobsMap>),
    /// Value (in seconds) of a metric in the same scrape whose name matches.
    StartTimeMetric(Regex),
}

impl StartTimeStrategy {
    pub fn from_config(config: &ReceiverConfig) -> Result<Self> {
        if config.use_start_time_metric {
            let pattern = config.start_time_metric_pattern();
            let regex = Regex::new(pattern).map_err(|err| {
                ReceiverError::Config(format!("start_time_metric_regex {pattern:?}: {err}"))
            })?;
            return Ok(Self::StartTimeMetric(regex));
        }

        if config.start_time_ttl.is_zero() {
            return Err(ReceiverError::Config("start_time_ttl must be greater than zero".into()));
        }
        Ok(Self::JobsMap(Arc::new(JobsMap::new(config.start_time_ttl))))
    }

    pub fn jobs_map(&self) -> Option<&Arc<JobsMap>> {
        match self {
            Self::JobsMap(map) => Some(map),
            Self::StartTimeMetric(_) => None,
        }
    }

    /// Start time shared by the whole scrape, if the strategy has one.
    pub(super) fn batch_start_time(&self, job: &str, instance: &str, samples: &[Sample]) -> Result<Option<i64>> {
        let Self::StartTimeMetric(regex) = self else {
            return Ok(None);
        };
        samples
            .iter()
            .find(|sample| sample.metric_name().is_some_and(|name| regex.is_match(name)))
            .map(|sample| Some((sample.value * 1000.0) as i64))
            .ok_or_else(|| ReceiverError::StartTimeMetricMissing {
                job: job.to_string(),
                instance: instance.to_string(),
            })
    }

    pub(super) fn series_start_time(&self, job: &str, instance: &str, sample: &Sample) -> Option<i64> {
        match self {
            Self::JobsMap(map) => Some(map.start_time(
                SeriesKey::new(job, instance, sample.labels.fingerprint()),
                sample.timestamp_ms,
            )),
            Self::StartTimeMetric(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_map_is_the_default() {
        let strategy = StartTimeStrategy::from_config(&ReceiverConfig::default()).unwrap();
        let map = strategy.jobs_map().unwrap();
        assert_eq!(map.ttl(), crate::config::DEFAULT_START_TIME_TTL);
    }

    #[test]
    fn start_time_metric_uses_configured_pattern() {
        let config = ReceiverConfig {
            use_start_time_metric: true,
            start_time_metric_regex: Some("^app_started_seconds$".into()),
            ..ReceiverConfig::default()
        };
        match StartTimeStrategy::from_config(&config).unwrap() {
            StartTimeStrategy::StartTimeMetric(regex) => assert_eq!(regex.as_str(), "^app_started_seconds$"),
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    #[test]
    fn invalid_pattern_or_ttl_is_a_config_error() {
        let bad_regex = ReceiverConfig {
            use_start_time_metric: true,
            start_time_metric_regex: Some("(unclosed".into()),
            ..ReceiverConfig::default()
        };
        assert!(StartTimeStrategy::from_config(&bad_regex).unwrap_err().is_config());

        let zero_ttl = ReceiverConfig {
            start_time_ttl: std::time::Duration::ZERO,
            ..ReceiverConfig::default()
        };
        assert!(StartTimeStrategy::from_config(&zero_ttl).unwrap_err().is_config());
    }
}
