//! Error taxonomy for the metering engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeteringError>;

#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("Validation failed for {field}: {message}")]
    ValidationError { field: String, message: String },

    #[error("Store operation '{operation}' failed: {source}")]
    StoreError {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Event log error: {message}")]
    LogError { message: String },

    #[error("Failed to attribute event {event_id}: {message}")]
    AttributionError { event_id: String, message: String },

    #[error("Billing computation failed: {message}")]
    ComputationError { message: String },

    #[error("Price {price_id} is not billable: {reason}")]
    InvalidPrice { price_id: String, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] turnstile_common::ConfigurationError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl MeteringError {
    /// Transient errors are safe to redrive through the log; everything else
    /// is permanent for the message that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeteringError::StoreError { .. }
                | MeteringError::LogError { .. }
                | MeteringError::Timeout { .. }
        )
    }
}
