//! Core types for the control plane.
//!
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for limits, breakers and capabilities

mod config;
mod errors;

pub use config::{CapabilityConfig, Config, DispatchConfig, ObservabilityConfig};
pub use errors::{Error, Result};
