//! Receiver configuration.
//!
//! The configuration is usually read from TOML. Durations are written in
//! human-readable form (`"15s"`, `"2m"`).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::discovery::DiscoveryConfig;
use crate::error::{ReceiverError, Result};
use crate::relabel::RelabelConfig;

pub const DEFAULT_RECEIVER_NAME: &str = "prometheus";
pub const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_METRICS_PATH: &str = "/metrics";
pub const DEFAULT_SCHEME: &str = "http";
/// How long a series' start time is remembered without being refreshed.
pub const DEFAULT_START_TIME_TTL: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_START_TIME_METRIC_REGEX: &str = "^process_start_time_seconds$";

/// Top-level receiver configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Identifies this receiver in emitted batches and logs.
    pub name: String,
    pub scrape_configs: Vec<ScrapeJobConfig>,
    /// Read start times from a metric in the scrape instead of tracking
    /// first-seen timestamps.
    pub use_start_time_metric: bool,
    /// Pattern for the start time metric name. Only used together with
    /// `use_start_time_metric`.
    pub start_time_metric_regex: Option<String>,
    #[serde(with = "duration_str")]
    pub start_time_ttl: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_RECEIVER_NAME.to_string(),
            scrape_configs: Vec::new(),
            use_start_time_metric: false,
            start_time_metric_regex: None,
            start_time_ttl: DEFAULT_START_TIME_TTL,
        }
    }
}

impl ReceiverConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        debug!(
            target: "scrapeline::config",
            path = %path.display(),
            jobs = config.scrape_configs.len(),
            "loaded receiver configuration"
        );
        Ok(config)
    }

    /// Discovery configuration keyed by job name.
    pub fn discovery_configs(&self) -> HashMap<String, Vec<DiscoveryConfig>> {
        self.scrape_configs
            .iter()
            .map(|job| (job.job_name.clone(), job.discovery.clone()))
            .collect()
    }

    pub fn start_time_metric_pattern(&self) -> &str {
        self.start_time_metric_regex
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .unwrap_or(DEFAULT_START_TIME_METRIC_REGEX)
    }
}

/// One logical scrape job.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeJobConfig {
    pub job_name: String,
    #[serde(with = "duration_str")]
    pub scrape_interval: Duration,
    #[serde(with = "duration_str")]
    pub scrape_timeout: Duration,
    pub metrics_path: String,
    pub scheme: String,
    /// Keep scraped labels that collide with target labels instead of
    /// renaming them to `exported_<name>`.
    pub honor_labels: bool,
    /// URL query parameters, exposed to relabeling as `__param_<name>`.
    pub params: BTreeMap<String, String>,
    pub discovery: Vec<DiscoveryConfig>,
    /// Applied to discovered targets before scraping.
    pub relabel_configs: Vec<RelabelConfig>,
    /// Applied to every scraped sample.
    pub metric_relabel_configs: Vec<RelabelConfig>,
}

impl Default for ScrapeJobConfig {
    fn default() -> Self {
        Self {
            job_name: String::new(),
            scrape_interval: DEFAULT_SCRAPE_INTERVAL,
            scrape_timeout: DEFAULT_SCRAPE_TIMEOUT,
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            scheme: DEFAULT_SCHEME.to_string(),
            honor_labels: false,
            params: BTreeMap::new(),
            discovery: Vec::new(),
            relabel_configs: Vec::new(),
            metric_relabel_configs: Vec::new(),
        }
    }
}

impl ScrapeJobConfig {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Self::default()
        }
    }

    /// Validates the scrape parameters of this job. Discovery configs are
    /// validated by the discovery manager.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ReceiverError::Config(format!("job {:?}: {msg}", self.job_name)));

        if self.job_name.trim().is_empty() {
            return Err(ReceiverError::Config("job_name must not be empty".into()));
        }
        if self.scrape_interval.is_zero() {
            return invalid("scrape_interval must be greater than zero".into());
        }
        if self.scrape_timeout.is_zero() {
            return invalid("scrape_timeout must be greater than zero".into());
        }
        if self.scrape_timeout > self.scrape_interval {
            return invalid(format!(
                "scrape_timeout {} exceeds scrape_interval {}",
                humantime::format_duration(self.scrape_timeout),
                humantime::format_duration(self.scrape_interval)
            ));
        }
        if !self.metrics_path.starts_with('/') {
            return invalid(format!("metrics_path {:?} must start with '/'", self.metrics_path));
        }
        if !matches!(self.scheme.as_str(), "http" | "https") {
            return invalid(format!("unsupported scheme {:?}", self.scheme));
        }
        for rule in self.relabel_configs.iter().chain(&self.metric_relabel_configs) {
            if let Err(err) = rule.validate() {
                return invalid(err.to_string());
            }
        }
        Ok(())
    }
}

/// Validates every job and rejects duplicate job names.
pub fn validate_jobs(jobs: &[ScrapeJobConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for job in jobs {
        job.validate()?;
        if !seen.insert(job.job_name.as_str()) {
            return Err(ReceiverError::Config(format!(
                "duplicate job_name {:?}",
                job.job_name
            )));
        }
    }
    Ok(())
}

pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
