//! Core error types for medtrack-core.
//!
//! Errors fall into two families with different propagation rules:
//!
//! - **Validation** ([`DoseError`], [`ValidationError`]): the request itself is
//!   illegal right now. Never retried, reported synchronously.
//! - **Infrastructure** ([`StoreError`]): the Authoritative or Mirror Store
//!   failed. Rate limits and transient I/O are retried by
//!   [`RetryPolicy`](crate::sync::RetryPolicy); everything else surfaces at once.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::{DoseKey, DoseState};

/// Core error type for medtrack-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Dose transition rejected by the state machine
    #[error(transparent)]
    Dose(#[from] DoseError),

    /// Authoritative or Mirror Store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed medication or reminder input
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// True when the failure comes from a timing rule the user can wait out.
    pub fn is_timing_rule(&self) -> bool {
        matches!(self, CoreError::Dose(DoseError::OutOfWindow { .. }))
    }

    /// True when the session has expired and the caller must re-authenticate.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CoreError::Store(StoreError::Unauthorized))
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            CoreError::Dose(DoseError::OutOfWindow { .. }) => {
                "You can't do this right now: the dose is outside its allowed time window.".into()
            }
            CoreError::Dose(e) => e.to_string(),
            CoreError::Store(StoreError::Unauthorized) => {
                "Your session has expired. Please sign in again.".into()
            }
            CoreError::Store(e) if e.is_retryable() => {
                "Temporary failure while saving. Please try again.".into()
            }
            CoreError::Store(e) => format!("The server rejected the request: {e}"),
            CoreError::Validation(e) => e.to_string(),
            other => format!("Unexpected error: {other}"),
        }
    }
}

/// Dose state machine rejections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DoseError {
    /// Transition attempted outside its legal time window
    #[error(
        "Dose {key} is outside its time window ({offset_secs}s from schedule, limit {window_secs}s)"
    )]
    OutOfWindow {
        key: DoseKey,
        /// Signed seconds between `now` and the scheduled time (positive = late).
        offset_secs: i64,
        window_secs: i64,
    },

    /// Medication, dose index or reminder does not exist, or its time is malformed
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// The dose is in a state from which this transition is not defined
    #[error("Dose {key} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        key: DoseKey,
        from: DoseState,
        to: DoseState,
    },
}

/// Authoritative/Mirror Store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store throttled the request
    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Session expired or token rejected
    #[error("Authentication required")]
    Unauthorized,

    /// Network failure or timeout
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Record not found on the store
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store refused the request
    #[error("Rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether the retry policy may try this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::RateLimited { .. } | StoreError::TransientIo(_)
        )
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            StoreError::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            StoreError::TransientIo(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown dot-path key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Validation errors for medication and reminder input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Required field missing or empty
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ValidationError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
