//! Core data model definitions shared across scrapeline crates.
#![allow(missing_docs)]

pub mod batch;
pub mod error;
pub mod labels;
pub mod sample;
pub mod target;

pub use batch::{MetricPoint, MetricsBatch};
pub use error::{ModelError, Result as ModelResult};
pub use labels::{
    ADDRESS_LABEL, INSTANCE_LABEL, JOB_LABEL, LabelSet, METRIC_NAME_LABEL,
    METRICS_PATH_LABEL, PARAM_LABEL_PREFIX, RESERVED_LABEL_PREFIX,
    SCHEME_LABEL, SCRAPE_JOB_LABEL, validate_label_name,
};
pub use sample::Sample;
pub use target::{TargetGroup, TargetSets};
