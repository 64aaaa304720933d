use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime};

use scrapeline_model::{
    ADDRESS_LABEL, INSTANCE_LABEL, JOB_LABEL, LabelSet, METRICS_PATH_LABEL, PARAM_LABEL_PREFIX,
    RESERVED_LABEL_PREFIX, SCHEME_LABEL,
};
use url::Url;

use crate::config::ScrapeJobConfig;
use crate::error::{ReceiverError, Result};
use crate::relabel;

/// A resolved target: relabeled, with its final URL.
#[derive(Clone, Debug, PartialEq)]
pub struct ScrapeTarget {
    pub job: String,
    /// Labels attached to every sample scraped from this target.
    pub labels: LabelSet,
    /// Labels as discovered, before relabeling.
    pub discovered: LabelSet,
    pub url: Url,
    pub interval: Duration,
    pub timeout: Duration,
}

impl ScrapeTarget {
    pub fn instance(&self) -> &str {
        self.labels.value(INSTANCE_LABEL)
    }

    /// Identity used to decide whether two discovery rounds describe the
    /// same target.
    pub(crate) fn identity(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.labels.hash(&mut hasher);
        self.url.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TargetHealth {
    #[default]
    Unknown,
    Up,
    Down,
}

impl fmt::Display for TargetHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetHealth::Unknown => "unknown",
            TargetHealth::Up => "up",
            TargetHealth::Down => "down",
        })
    }
}

/// Live state of one scrape loop.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetStatus {
    pub job: String,
    pub instance: String,
    pub url: Url,
    pub labels: LabelSet,
    pub health: TargetHealth,
    pub last_error: Option<String>,
    pub last_scrape: Option<SystemTime>,
    pub last_duration: Option<Duration>,
    pub samples_scraped: usize,
}

impl TargetStatus {
    pub(crate) fn new(target: &ScrapeTarget) -> Self {
        Self {
            job: target.job.clone(),
            instance: target.instance().to_string(),
            url: target.url.clone(),
            labels: target.labels.clone(),
            health: TargetHealth::Unknown,
            last_error: None,
            last_scrape: None,
            last_duration: None,
            samples_scraped: 0,
        }
    }
}

/// Turns one discovered target into a [`ScrapeTarget`].
///
/// Returns `Ok(None)` when relabeling drops the target.
pub(crate) fn resolve_target(
    job: &ScrapeJobConfig,
    group_labels: &LabelSet,
    target_labels: &LabelSet,
) -> Result<Option<ScrapeTarget>> {
    let mut labels = group_labels.clone();
    for (name, value) in target_labels.iter() {
        labels.insert(name, value);
    }

    let mut defaults = LabelSet::from([
        (JOB_LABEL, job.job_name.as_str()),
        (SCHEME_LABEL, job.scheme.as_str()),
        (METRICS_PATH_LABEL, job.metrics_path.as_str()),
    ]);
    for (name, value) in &job.params {
        defaults.insert(format!("{PARAM_LABEL_PREFIX}{name}"), value.as_str());
    }
    labels.merge_missing(&defaults);

    let Some(mut relabeled) = relabel::process(&labels, &job.relabel_configs) else {
        return Ok(None);
    };

    let address = relabeled.value(ADDRESS_LABEL).to_string();
    if address.is_empty() {
        return Err(ReceiverError::ScrapeTarget {
            target: labels.to_string(),
            reason: "no __address__ left after relabeling".into(),
        });
    }
    if !relabeled.contains(INSTANCE_LABEL) {
        relabeled.insert(INSTANCE_LABEL, address.as_str());
    }

    let url = target_url(&relabeled, &address)?;
    relabeled.retain(|name, _| !name.starts_with(RESERVED_LABEL_PREFIX));

    Ok(Some(ScrapeTarget {
        job: job.job_name.clone(),
        labels: relabeled,
        discovered: labels,
        url,
        interval: job.scrape_interval,
        timeout: job.scrape_timeout,
    }))
}

/// Builds `scheme://address/path?query` from the relabeled target.
///
/// A query already present in `__metrics_path__` is kept and `__param_*`
/// labels are appended after it.
fn target_url(labels: &LabelSet, address: &str) -> Result<Url> {
    let invalid = |reason: String| ReceiverError::ScrapeTarget {
        target: labels.to_string(),
        reason,
    };

    let scheme = labels.value(SCHEME_LABEL);
    if !matches!(scheme, "http" | "https") {
        return Err(invalid(format!("unsupported scheme {scheme:?}")));
    }
    let mut url = Url::parse(&format!("{scheme}://{address}"))
        .map_err(|err| invalid(format!("invalid address {address:?}: {err}")))?;

    let metrics_path = labels.value(METRICS_PATH_LABEL);
    let (path, query) = match metrics_path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (metrics_path, None),
    };
    url.set_path(path);
    url.set_query(query);

    let params: Vec<(&str, &str)> = labels
        .iter()
        .filter_map(|(name, value)| name.strip_prefix(PARAM_LABEL_PREFIX).map(|param| (param, value)))
        .collect();
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url)
}
