//! Error types for the amplification harness.

use thiserror::Error;

/// Errors that can occur anywhere in the pipeline.
#[derive(Debug, Error)]
pub enum AmpError {
    /// The record cannot be turned into an [`crate::Event`] even after defaulting.
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    /// Deliberate failure raised for every POISON delivery attempt.
    #[error("poison payload simulated failure for event {event_id}")]
    InducedPoison { event_id: String },
    #[error("failed sending to queue {queue}: {reason}")]
    DownstreamSend { queue: String, reason: String },
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AmpError {
    /// True for the intentional POISON failure, which callers expect.
    pub fn is_induced(&self) -> bool {
        matches!(self, Self::InducedPoison { .. })
    }
}

impl From<serde_json::Error> for AmpError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for pipeline operations.
pub type AmpResult<T> = Result<T, AmpError>;
