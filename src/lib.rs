//! # Platewise Core - Tool Execution Control Plane
//!
//! Runs food journal tools on behalf of a protocol server:
//! - Tool registry with schemas inferred from declared parameters
//! - Dependency injection for the journal store, inference and HTTP capabilities
//! - Per-tool sliding-window rate limiting
//! - Per-resource circuit breaking for failing upstreams
//! - A dispatcher that always answers with a structured result
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────────────────────────────────┐
//!   tools/call  →  │               Dispatcher                 │
//!                  │  RateLimiter → ToolRegistry → access     │
//!                  │      → validate → DependencyContainer    │
//!                  │      → CircuitBreaker → handler          │
//!                  └──────────────────────────────────────────┘
//!                                     │
//!                          ExecutionRecord → sink
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod clock;
pub mod deps;
pub mod dispatch;
pub mod journal;
pub mod resilience;
pub mod server;
pub mod tools;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
