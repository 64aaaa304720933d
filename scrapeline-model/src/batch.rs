//! Downstream representation of one committed scrape.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::labels::LabelSet;

/// One data point in a [`MetricsBatch`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetricPoint {
    pub name: String,
    /// Series labels without `__name__`.
    pub labels: LabelSet,
    /// When the series began accumulating, if known.
    pub start_timestamp_ms: Option<i64>,
    pub timestamp_ms: i64,
    pub value: f64,
}

/// Everything one scrape of one target produced, attributed to the receiver,
/// job and instance it came from.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetricsBatch {
    pub receiver: String,
    pub job: String,
    pub instance: String,
    pub points: Vec<MetricPoint>,
}

impl MetricsBatch {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, name: &str) -> Option<&MetricPoint> {
        self.points.iter().find(|point| point.name == name)
    }
}
