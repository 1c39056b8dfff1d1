//! Errors raised by capability implementations.

use thiserror::Error;

use crate::resilience::{Classify, FailureKind};

/// Failure of a persistence, inference or outbound HTTP call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("upstream throttled the request")]
    Throttled,

    #[error("invalid upstream response: {0}")]
    Decode(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl CapabilityError {
    /// Classify an HTTP error status.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            429 => CapabilityError::Throttled,
            404 => CapabilityError::NotFound(message),
            400..=499 => CapabilityError::InvalidInput(format!("{}: {}", status, message)),
            _ => CapabilityError::Upstream { status, message },
        }
    }
}

impl Classify for CapabilityError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            CapabilityError::Timeout(_) => FailureKind::Timeout,
            CapabilityError::Connection(_) => FailureKind::Connection,
            CapabilityError::Upstream { .. } => FailureKind::Upstream,
            CapabilityError::Throttled => FailureKind::Throttled,
            CapabilityError::Decode(_) => FailureKind::Decode,
            CapabilityError::InvalidInput(_) => FailureKind::InvalidInput,
            CapabilityError::NotFound(_) => FailureKind::NotFound,
        }
    }
}

impl From<reqwest::Error> for CapabilityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CapabilityError::Timeout(err.to_string())
        } else if err.is_decode() {
            CapabilityError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            CapabilityError::from_status(status.as_u16(), err.to_string())
        } else if err.is_builder() {
            CapabilityError::InvalidInput(err.to_string())
        } else {
            CapabilityError::Connection(err.to_string())
        }
    }
}
