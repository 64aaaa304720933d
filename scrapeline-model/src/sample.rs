#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::labels::LabelSet;

/// A single scraped value, as handed from the scrape loop to an appender.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sample {
    /// Full series identity, including `__name__`.
    pub labels: LabelSet,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(labels: LabelSet, timestamp_ms: i64, value: f64) -> Self {
        Self {
            labels,
            timestamp_ms,
            value,
        }
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.labels.metric_name()
    }
}
