//! File based discovery: JSON files in the Prometheus `file_sd` format,
//! re-read periodically.
//!
//! ```json
//! [
//!   { "targets": ["10.0.0.1:9100"], "labels": { "env": "prod" } }
//! ]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use scrapeline_model::{ADDRESS_LABEL, LabelSet, TargetGroup};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::static_sd::validate_address;
use super::{Discoverer, TargetUpdates};
use crate::config::duration_str;
use crate::error::{ReceiverError, Result};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Set on every target found in a file.
pub const FILEPATH_LABEL: &str = "__meta_filepath";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSdConfig {
    pub files: Vec<PathBuf>,
    #[serde(default = "default_refresh_interval", with = "duration_str")]
    pub refresh_interval: Duration,
}

fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}

impl FileSdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.files.is_empty() {
            return Err(ReceiverError::Config("file discovery needs at least one file".into()));
        }
        if self.refresh_interval.is_zero() {
            return Err(ReceiverError::Config("file discovery refresh_interval must be non-zero".into()));
        }
        for path in &self.files {
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                return Err(ReceiverError::Config(format!(
                    "file discovery only reads .json files, got {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FileTargetGroup {
    targets: Vec<String>,
    #[serde(default)]
    labels: LabelSet,
}

#[derive(Debug)]
pub struct FileDiscoverer {
    config: FileSdConfig,
    /// Number of groups each file produced last time, so shrinking files
    /// can clear the groups they no longer contain.
    last_counts: HashMap<PathBuf, usize>,
}

impl FileDiscoverer {
    pub fn new(config: FileSdConfig) -> Self {
        Self {
            config,
            last_counts: HashMap::new(),
        }
    }

    async fn refresh(&mut self) -> Vec<TargetGroup> {
        let mut groups = Vec::new();
        for path in &self.config.files {
            let parsed = match read_groups(path).await {
                Ok(parsed) => parsed,
                Err(err) => {
                    // Keep serving the last good contents of this file.
                    warn!(target: "scrapeline::discovery", path = %path.display(), error = %err, "failed to read target file");
                    continue;
                }
            };

            let previous = self.last_counts.insert(path.clone(), parsed.len()).unwrap_or(0);
            let count = parsed.len();
            groups.extend(parsed);
            groups.extend((count..previous).map(|index| TargetGroup::new(source_for(path, index))));
        }
        groups
    }
}

fn source_for(path: &Path, index: usize) -> String {
    format!("{}:{index}", path.display())
}

async fn read_groups(path: &Path) -> Result<Vec<TargetGroup>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let parsed: Vec<FileTargetGroup> = serde_json::from_str(&raw)?;

    let mut groups = Vec::with_capacity(parsed.len());
    for (index, entry) in parsed.into_iter().enumerate() {
        let mut labels = entry.labels;
        labels.insert(FILEPATH_LABEL, path.display().to_string());

        let mut targets = Vec::with_capacity(entry.targets.len());
        for address in entry.targets {
            validate_address(&address)?;
            targets.push(LabelSet::from([(ADDRESS_LABEL, address)]));
        }
        groups.push(TargetGroup {
            source: source_for(path, index),
            targets,
            labels,
        });
    }
    Ok(groups)
}

#[async_trait]
impl Discoverer for FileDiscoverer {
    async fn run(mut self: Box<Self>, shutdown: CancellationToken, updates: TargetUpdates) -> Result<()> {
        let interval = self.config.refresh_interval;
        loop {
            let groups = self.refresh().await;
            debug!(target: "scrapeline::discovery", job = updates.job(), groups = groups.len(), "file discovery refreshed");
            if updates.send(groups).await.is_err() {
                return Ok(());
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        let ok = FileSdConfig {
            files: vec!["targets.json".into()],
            refresh_interval: Duration::from_secs(30),
        };
        assert!(ok.validate().is_ok());

        let empty = FileSdConfig {
            files: vec![],
            ..ok.clone()
        };
        assert!(empty.validate().is_err());

        let yaml = FileSdConfig {
            files: vec!["targets.yaml".into()],
            ..ok.clone()
        };
        assert!(yaml.validate().is_err());

        let zero = FileSdConfig {
            refresh_interval: Duration::ZERO,
            ..ok
        };
        assert!(zero.validate().is_err());
    }

    #[tokio::test]
    async fn refresh_reads_groups_and_clears_removed_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        std::fs::write(
            &path,
            r#"[
                {"targets": ["a:1", "b:2"], "labels": {"env": "prod"}},
                {"targets": ["c:3"]}
            ]"#,
        )
        .unwrap();

        let mut discoverer = FileDiscoverer::new(FileSdConfig {
            files: vec![path.clone()],
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        });

        let groups = discoverer.refresh().await;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].targets.len(), 2);
        assert_eq!(groups[0].labels.get("env"), Some("prod"));
        assert_eq!(groups[1].labels.get(FILEPATH_LABEL), Some(path.display().to_string().as_str()));

        std::fs::write(&path, r#"[{"targets": ["a:1"]}]"#).unwrap();
        let groups = discoverer.refresh().await;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].targets.len(), 1);
        assert!(groups[1].is_empty(), "second group should be cleared");
        assert_eq!(groups[1].source, source_for(&path, 1));
    }

    #[tokio::test]
    async fn unreadable_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        let broken = dir.path().join("broken.json");
        std::fs::write(&good, r#"[{"targets": ["a:1"]}]"#).unwrap();
        std::fs::write(&broken, "{ not json").unwrap();

        let mut discoverer = FileDiscoverer::new(FileSdConfig {
            files: vec![good, broken, dir.path().join("missing.json")],
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        });

        let groups = discoverer.refresh().await;
        assert_eq!(groups.len(), 1);
    }
}
