//! Label sets and the well-known label names used during discovery,
//! relabeling and scraping.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Address of a target before relabeling (`host:port`).
pub const ADDRESS_LABEL: &str = "__address__";
pub const SCHEME_LABEL: &str = "__scheme__";
pub const METRICS_PATH_LABEL: &str = "__metrics_path__";
pub const METRIC_NAME_LABEL: &str = "__name__";
pub const PARAM_LABEL_PREFIX: &str = "__param_";
pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";

/// Labels with this prefix are internal and are stripped once target
/// relabeling has finished.
pub const RESERVED_LABEL_PREFIX: &str = "__";

/// Carries the originating scrape job across arbitrary relabeling.
///
/// A single leading underscore keeps it out of the `__` namespace that is
/// stripped after target relabeling, while still staying clear of the names
/// exporters conventionally emit.
pub const SCRAPE_JOB_LABEL: &str = "_scrapeline_scrape_job";

/// Checks a label name against the `[a-zA-Z_][a-zA-Z0-9_]*` grammar.
pub fn validate_label_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_head = matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic());
    if valid_head && chars.all(|c| c == '_' || c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(ModelError::InvalidLabelName(name.to_string()))
    }
}

/// An ordered set of label name/value pairs.
///
/// Ordering is by label name, which keeps [`LabelSet::fingerprint`] and the
/// `Display` output stable regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Returns the value for `name`, or the empty string when absent.
    pub fn value(&self, name: &str) -> &str {
        self.get(name).unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.0.retain(|name, value| keep(name, value));
    }

    /// Copies every label from `other` that is not already present.
    pub fn merge_missing(&mut self, other: &LabelSet) {
        for (name, value) in other.iter() {
            self.0
                .entry(name.to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    /// A hash of the full label set, stable within a process.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, (name, value)) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        f.write_str("}")
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl IntoIterator for LabelSet {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let mut a = LabelSet::new();
        a.insert("job", "api");
        a.insert("instance", "10.0.0.1:9100");

        let b = LabelSet::from([("instance", "10.0.0.1:9100"), ("job", "api")]);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a, b);
    }

    #[test]
    fn display_is_sorted_and_quoted() {
        let labels = LabelSet::from([("b", "2"), ("a", "x\"y")]);
        assert_eq!(labels.to_string(), r#"{a="x\"y", b="2"}"#);
    }

    #[test]
    fn merge_missing_keeps_existing_values() {
        let mut labels = LabelSet::from([("env", "prod")]);
        labels.merge_missing(&LabelSet::from([("env", "dev"), ("zone", "a")]));

        assert_eq!(labels.get("env"), Some("prod"));
        assert_eq!(labels.get("zone"), Some("a"));
    }

    #[test]
    fn label_name_grammar() {
        assert!(validate_label_name(SCRAPE_JOB_LABEL).is_ok());
        assert!(validate_label_name("__address__").is_ok());
        assert!(validate_label_name("Job_2").is_ok());
        assert!(validate_label_name("").is_err());
        assert!(validate_label_name("2xx").is_err());
        assert!(validate_label_name("has-dash").is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_as_plain_map() {
        let labels = LabelSet::from([("env", "prod")]);
        let json = serde_json::to_string(&labels).unwrap();
        assert_eq!(json, r#"{"env":"prod"}"#);
    }
}
