use async_trait::async_trait;
use scrapeline_model::{ADDRESS_LABEL, LabelSet, TargetGroup};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Discoverer, TargetUpdates};
use crate::error::{ReceiverError, Result};

/// A fixed list of `host:port` targets sharing the same labels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticConfig {
    pub targets: Vec<String>,
    #[serde(default)]
    pub labels: LabelSet,
}

impl StaticConfig {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            labels: LabelSet::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for target in &self.targets {
            validate_address(target)?;
        }
        Ok(())
    }

    fn group(&self, source: String) -> TargetGroup {
        TargetGroup {
            source,
            targets: self
                .targets
                .iter()
                .map(|addr| LabelSet::from([(ADDRESS_LABEL, addr.as_str())]))
                .collect(),
            labels: self.labels.clone(),
        }
    }
}

/// Addresses are bare `host[:port]`; scheme and path come from the job.
pub(crate) fn validate_address(address: &str) -> Result<()> {
    let invalid = |reason: String| -> Result<()> {
        Err(ReceiverError::Config(format!("target {address:?} {reason}")))
    };

    if address.is_empty() {
        return invalid("is empty".into());
    }
    if address.chars().any(char::is_whitespace) {
        return invalid("contains whitespace".into());
    }
    if address.contains('/') {
        return invalid("must not contain a scheme or path".into());
    }

    let parsed = match Url::parse(&format!("http://{address}")) {
        Ok(parsed) => parsed,
        Err(err) => return invalid(format!("is not a valid host[:port]: {err}")),
    };
    if !parsed.username().is_empty() || parsed.query().is_some() || parsed.fragment().is_some() {
        return invalid("must be a bare host[:port]".into());
    }
    Ok(())
}

#[derive(Debug)]
pub struct StaticDiscoverer {
    config: StaticConfig,
}

impl StaticDiscoverer {
    pub fn new(config: StaticConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Discoverer for StaticDiscoverer {
    async fn run(self: Box<Self>, _shutdown: CancellationToken, updates: TargetUpdates) -> Result<()> {
        let source = format!("static/{}", updates.job());
        updates.send(vec![self.config.group(source)]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        assert!(validate_address("localhost:9090").is_ok());
        assert!(validate_address("[::1]:9090").is_ok());
        assert!(validate_address("node-exporter").is_ok());
        assert!(validate_address("").is_err());
        assert!(validate_address("http://host:80").is_err());
        assert!(validate_address("host:80/metrics").is_err());
        assert!(validate_address("two words").is_err());
        assert!(validate_address(":9090").is_err());
        assert!(validate_address("host:99999").is_err());
        assert!(validate_address("host:port").is_err());
        assert!(validate_address("user@host:80").is_err());
        assert!(validate_address("host:80?x=1").is_err());
    }

    #[test]
    fn group_carries_common_labels() {
        let config = StaticConfig {
            targets: vec!["a:1".into(), "b:2".into()],
            labels: LabelSet::from([("env", "prod")]),
        };
        let group = config.group("static/x".into());

        assert_eq!(group.targets.len(), 2);
        assert_eq!(group.targets[1].get(ADDRESS_LABEL), Some("b:2"));
        assert_eq!(group.labels.get("env"), Some("prod"));
    }
}
