//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Variants
//! that can happen during a tool call are converted to structured envelopes at
//! the dispatcher boundary; only registration and configuration errors ever
//! escape to the process.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the control plane.
#[derive(Error, Debug)]
pub enum Error {
    /// A tool with this name is already registered (startup, fatal).
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),

    /// No tool with this name (caller error).
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Admission rejected by the sliding-window limiter.
    #[error("rate limit exceeded for {tool}: {limit} calls per {window_secs}s, retry after {retry_after:.1}s")]
    RateLimitExceeded {
        tool: String,
        limit: usize,
        window_secs: u64,
        retry_after: f64,
    },

    /// Upstream protection: the named circuit is open.
    #[error("circuit '{name}' is open, retry after {time_remaining:.1}s")]
    CircuitOpen { name: String, time_remaining: f64 },

    /// A handler failed; the message is internal and never sent to callers.
    #[error("handler execution failed: {0}")]
    HandlerExecution(String),

    /// Caller lacks the permission the tool requires.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Validation errors (bad names, bad arguments).
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Seconds until the caller may retry, for backpressure errors.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Error::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            Error::CircuitOpen { time_remaining, .. } => Some(*time_remaining),
            _ => None,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn duplicate_tool(name: impl Into<String>) -> Self {
        Self::DuplicateTool(name.into())
    }

    pub fn unknown_tool(name: impl Into<String>) -> Self {
        Self::UnknownTool(name.into())
    }

    pub fn circuit_open(name: impl Into<String>, time_remaining: f64) -> Self {
        Self::CircuitOpen {
            name: name.into(),
            time_remaining,
        }
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::HandlerExecution(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
