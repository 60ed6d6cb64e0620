//! Error taxonomy for the monitoring pipeline
//!
//! Every variant here is recovered locally: fetch failures feed the
//! poll-interval backoff, training refusals and scoring failures fall back
//! to threshold detection, and persistence failures skip a single record.
//! None of them abort the agent.

use thiserror::Error;

/// Telemetry fetch failures. Transient: counted toward the
/// consecutive-error backoff, never fatal.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("telemetry request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("telemetry endpoint returned status {0}")]
    Status(u16),

    #[error("telemetry fetch timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Model training outcomes that are not a trained model.
#[derive(Debug, Error)]
pub enum TrainError {
    /// A refusal, not a failure: callers keep using fallback detection
    /// until enough history accumulates.
    #[error("insufficient training data: {got} samples, need {need}")]
    InsufficientData { got: usize, need: usize },

    #[error("training data is empty or has no usable columns")]
    DegenerateData,

    #[error("training task failed: {0}")]
    Task(String),
}

/// Scoring a feature vector against an incompatible model.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("feature row has {got} columns, model expects {expected}")]
    ColumnMismatch { got: usize, expected: usize },
}

/// Failures writing to or reading from the persistence sink.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

/// Failures loading or saving persisted model bundles.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Task(String),
}
