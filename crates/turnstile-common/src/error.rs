//! Configuration errors shared by every Turnstile service config loader.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to parse configuration: {details}")]
    ParseError { details: String },

    #[error("Invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Configuration validation failed: {details}")]
    ValidationFailed { details: String },

    #[error("Missing required configuration key: {key}")]
    MissingKey { key: String },
}
