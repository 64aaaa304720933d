use thiserror::Error;

use crate::receiver::ReceiverState;

#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Scrape manager failed: {0}")]
    Scrape(String),

    #[error("Scrape of {target} failed: {reason}")]
    ScrapeTarget { target: String, reason: String },

    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    #[error("Start time metric not found for job {job:?} instance {instance:?}")]
    StartTimeMetricMissing { job: String, instance: String },

    #[error("Downstream consumer rejected batch: {0}")]
    Consumer(String),

    #[error("Background task {task} panicked")]
    TaskPanicked { task: &'static str },

    #[error("Receiver is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: ReceiverState,
        actual: ReceiverState,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReceiverError {
    /// Whether the error came from configuration validation rather than from
    /// a running subsystem.
    pub fn is_config(&self) -> bool {
        matches!(self, ReceiverError::Config(_) | ReceiverError::ConfigParse(_))
    }
}

impl From<scrapeline_model::ModelError> for ReceiverError {
    fn from(err: scrapeline_model::ModelError) -> Self {
        ReceiverError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReceiverError>;
