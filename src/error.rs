//! Error types for training and evaluation routines.

use thiserror::Error;

/// Errors that can occur while building or driving a routine.
#[derive(Error, Debug)]
pub enum TrainError {
    /// Error in loss computation.
    #[error("Loss computation error: {0}")]
    LossError(String),

    /// Error in batch processing.
    #[error("Batch processing error: {0}")]
    BatchError(String),

    /// Error in metrics computation.
    #[error("Metrics error: {0}")]
    MetricsError(String),

    /// Error with invalid parameter.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Error in model operations.
    #[error("Model error: {0}")]
    ModelError(String),

    /// Construction-time configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A call was made without context the configuration requires.
    #[error("Missing context: {0}")]
    MissingContext(String),

    /// Error while fitting or applying post-hoc calibration.
    #[error("Calibration error: {0}")]
    CalibrationError(String),

    /// Arrays with incompatible shapes were combined.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// I/O failure (config files, log sinks).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

/// Result type for training operations.
pub type TrainResult<T> = Result<T, TrainError>;
