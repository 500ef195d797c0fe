//! Error types for the review pipeline.

use thiserror::Error;

/// Errors surfaced by publishers, the dispatcher, and the handler registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("Fetch error: {0}")]
    Fetch(String),
    #[error("Handler error: {0}")]
    Handler(String),
    #[error("No handler registered for review type: {0}")]
    UnknownReviewType(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Terminated: {0}")]
    Terminated(String),
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        PipelineError::Handler(format!("JSON deserialization error: {error}"))
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Result of a blocking fetch invocation. The error side is deliberately
/// open so callers can surface their own storage errors; the publisher
/// folds it into [`PipelineError::Fetch`].
pub type FetchResult<T> = std::result::Result<Vec<T>, Box<dyn std::error::Error + Send + Sync>>;
