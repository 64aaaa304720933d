use std::collections::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::labels::LabelSet;

/// A set of targets sharing common labels, as produced by one discovery
/// provider.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TargetGroup {
    /// Identifies the group within its provider so later updates can
    /// replace it.
    pub source: String,
    /// Each target is a label set that carries at least `__address__`.
    pub targets: Vec<LabelSet>,
    /// Labels common to every target in the group.
    #[cfg_attr(feature = "serde", serde(default))]
    pub labels: LabelSet,
}

impl TargetGroup {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Current target groups per scrape job name.
pub type TargetSets = HashMap<String, Vec<TargetGroup>>;
