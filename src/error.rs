use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectorError {
    /// Interface or driver failure in the capture loop.
    #[error("Capture fault: {0}")]
    CaptureFault(String),

    #[error("Queue overflow: capacity {capacity} reached, packet dropped")]
    QueueOverflow { capacity: usize },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid model state: {0}")]
    InvalidModelState(String),

    #[error("Model load failure for {}: {reason}", path.display())]
    ModelLoadFailure { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl DetectorError {
    /// Whether the error should take the whole pipeline down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectorError::CaptureFault(_))
    }
}

impl From<&str> for DetectorError {
    fn from(msg: &str) -> Self {
        DetectorError::Config(msg.to_string())
    }
}

impl From<String> for DetectorError {
    fn from(msg: String) -> Self {
        DetectorError::Config(msg)
    }
}

impl From<ctrlc::Error> for DetectorError {
    fn from(err: ctrlc::Error) -> Self {
        DetectorError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DetectorError>;
