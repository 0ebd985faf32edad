use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyticsError {
    #[error("Malformed case record at row {row}: {reason}")]
    MalformedRecord { row: usize, reason: String },

    #[error("Not enough history to forecast: need at least {required} periods, got {available}")]
    InsufficientHistory { required: usize, available: usize },

    #[error("Unknown dimension: {0}")]
    UnknownDimension(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;
