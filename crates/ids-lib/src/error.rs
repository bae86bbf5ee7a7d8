//! Error taxonomy for the detection pipeline
//!
//! Per-record faults (`Schema`, `NotFitted`, `Inference`, `Persistence`) are
//! isolated by the monitoring loop; `StreamRead` is a per-tick fault that is
//! retried on the next poll. `InvalidAction` is only produced at the control
//! surface.

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = IdsError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum IdsError {
    /// Reference or input data is missing a required field or holds a value
    /// of the wrong kind
    #[error("schema error: {0}")]
    Schema(String),

    /// Normalizer or oracle used before being fitted/loaded
    #[error("{0} has not been fitted")]
    NotFitted(&'static str),

    /// Transient fault reading the external record source
    #[error("failed to read record source {source_id}: {reason}")]
    StreamRead { source_id: String, reason: String },

    /// Ledger write or read fault
    #[error("ledger error: {0}")]
    Persistence(String),

    /// Control-surface call with an unrecognized action
    #[error("invalid action: {0:?}")]
    InvalidAction(String),

    /// Oracle runtime fault (model execution or malformed output)
    #[error("inference failed: {0}")]
    Inference(String),

    /// Blocking pipeline task panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IdsError {
    pub fn missing_field(field: &str) -> Self {
        IdsError::Schema(format!("missing required field '{}'", field))
    }

    pub fn stream_read(source_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        IdsError::StreamRead {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Metric label for faults that only affect a single record, `None` for
    /// everything else
    pub fn record_fault_kind(&self) -> Option<&'static str> {
        match self {
            IdsError::Schema(_) => Some("schema"),
            IdsError::NotFitted(_) => Some("not_fitted"),
            IdsError::Inference(_) => Some("inference"),
            IdsError::Persistence(_) => Some("persistence"),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for IdsError {
    fn from(e: rusqlite::Error) -> Self {
        IdsError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for IdsError {
    fn from(e: serde_json::Error) -> Self {
        IdsError::Persistence(format!("failed to serialize feature snapshot: {}", e))
    }
}
