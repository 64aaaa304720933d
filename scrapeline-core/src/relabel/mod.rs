//! Relabeling rules applied to target label sets before scraping and to
//! sample label sets after scraping.
//!
//! The evaluation semantics follow Prometheus: source label values are
//! joined with the separator, matched against a fully anchored regex, and
//! the action decides what happens to the label set.

pub mod inject;

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use scrapeline_model::{LabelSet, validate_label_name};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{ReceiverError, Result};

pub use inject::{inject_scrape_job_label, scrape_job_rule};

const DEFAULT_SEPARATOR: &str = ";";
const DEFAULT_REGEX: &str = "(.*)";
const DEFAULT_REPLACEMENT: &str = "$1";

static MATCH_ALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^(?s:(.*))$").expect("match-all pattern compiles"));

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelabelAction {
    #[default]
    Replace,
    Keep,
    Drop,
    HashMod,
    LabelMap,
    LabelDrop,
    LabelKeep,
}

/// A regex anchored at both ends, remembering the pattern it was built from.
#[derive(Clone)]
pub struct RelabelRegex {
    pattern: String,
    compiled: Regex,
}

impl RelabelRegex {
    pub fn new(pattern: impl Into<String>) -> std::result::Result<Self, regex::Error> {
        let pattern = pattern.into();
        let compiled = Regex::new(&format!("^(?s:{pattern})$"))?;
        Ok(Self { pattern, compiled })
    }

    /// Matches any value, including the empty string.
    pub fn match_all() -> Self {
        Self {
            pattern: DEFAULT_REGEX.to_string(),
            compiled: MATCH_ALL.clone(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.compiled.is_match(value)
    }

    pub fn captures<'h>(&self, value: &'h str) -> Option<regex::Captures<'h>> {
        self.compiled.captures(value)
    }
}

impl Default for RelabelRegex {
    fn default() -> Self {
        Self::match_all()
    }
}

impl PartialEq for RelabelRegex {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl fmt::Debug for RelabelRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RelabelRegex").field(&self.pattern).finish()
    }
}

impl Serialize for RelabelRegex {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.pattern)
    }
}

impl<'de> Deserialize<'de> for RelabelRegex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        RelabelRegex::new(pattern).map_err(serde::de::Error::custom)
    }
}

/// One relabeling step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelabelConfig {
    pub source_labels: Vec<String>,
    pub separator: String,
    pub regex: RelabelRegex,
    /// Only used by [`RelabelAction::HashMod`].
    pub modulus: u64,
    pub target_label: String,
    pub replacement: String,
    pub action: RelabelAction,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: DEFAULT_SEPARATOR.to_string(),
            regex: RelabelRegex::default(),
            modulus: 0,
            target_label: String::new(),
            replacement: DEFAULT_REPLACEMENT.to_string(),
            action: RelabelAction::default(),
        }
    }
}

impl RelabelConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| {
            Err(ReceiverError::Config(format!(
                "relabel {:?} rule: {msg}",
                self.action
            )))
        };

        for name in &self.source_labels {
            validate_label_name(name)?;
        }

        match self.action {
            RelabelAction::Replace | RelabelAction::HashMod if self.target_label.is_empty() => {
                invalid("target_label is required")
            }
            RelabelAction::Replace
                if !self.target_label.contains('$')
                    && validate_label_name(&self.target_label).is_err() =>
            {
                invalid("target_label is not a valid label name")
            }
            RelabelAction::HashMod if self.modulus == 0 => invalid("modulus must be non-zero"),
            RelabelAction::HashMod => Ok(validate_label_name(&self.target_label)?),
            RelabelAction::LabelMap if self.replacement.is_empty() => {
                invalid("replacement is required")
            }
            RelabelAction::LabelDrop | RelabelAction::LabelKeep
                if !self.source_labels.is_empty() || !self.target_label.is_empty() =>
            {
                invalid("source_labels and target_label must be empty")
            }
            _ => Ok(()),
        }
    }
}

/// Applies `rules` in order. Returns `None` when a rule drops the label set.
pub fn process(labels: &LabelSet, rules: &[RelabelConfig]) -> Option<LabelSet> {
    let mut labels = labels.clone();
    for rule in rules {
        if !apply(&mut labels, rule) {
            return None;
        }
    }
    Some(labels)
}

fn apply(labels: &mut LabelSet, rule: &RelabelConfig) -> bool {
    let value = rule
        .source_labels
        .iter()
        .map(|name| labels.value(name))
        .collect::<Vec<_>>()
        .join(&rule.separator);

    match rule.action {
        RelabelAction::Drop => return !rule.regex.is_match(&value),
        RelabelAction::Keep => return rule.regex.is_match(&value),
        RelabelAction::Replace => {
            let Some(captures) = rule.regex.captures(&value) else {
                return true;
            };
            let mut target = String::new();
            captures.expand(&rule.target_label, &mut target);
            if validate_label_name(&target).is_err() {
                return true;
            }
            let mut replaced = String::new();
            captures.expand(&rule.replacement, &mut replaced);
            if replaced.is_empty() {
                labels.remove(&target);
            } else {
                labels.insert(target, replaced);
            }
        }
        RelabelAction::HashMod => {
            let bucket = shard_of(&value) % rule.modulus.max(1);
            labels.insert(rule.target_label.clone(), bucket.to_string());
        }
        RelabelAction::LabelMap => {
            let mapped: Vec<(String, String)> = labels
                .iter()
                .filter_map(|(name, value)| {
                    let captures = rule.regex.captures(name)?;
                    let mut target = String::new();
                    captures.expand(&rule.replacement, &mut target);
                    Some((target, value.to_string()))
                })
                .collect();
            for (name, value) in mapped {
                labels.insert(name, value);
            }
        }
        RelabelAction::LabelDrop => labels.retain(|name, _| !rule.regex.is_match(name)),
        RelabelAction::LabelKeep => labels.retain(|name, _| rule.regex.is_match(name)),
    }
    true
}

/// Low 8 bytes of the SHA-256 digest, big-endian. Stable across builds so
/// every collector puts a target in the same shard.
fn shard_of(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest[24..]);
    u64::from_be_bytes(low)
}
