//! Tool infrastructure: handler contract, registry, schema inference, access.
//!
//! A tool is a [`ToolHandler`] plus a [`ToolDescriptor`] describing it. The
//! handler declares its parameters; the registry turns that declaration into
//! the caller-facing JSON Schema once, at registration.

pub mod access;
pub mod registry;
pub mod schema;

pub use access::{check_access, CallerIdentity};
pub use registry::{ToolDescriptor, ToolDescriptorBuilder, ToolListing, ToolRegistry};
pub use schema::{ParamDef, ParamDefault, ParamType};

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::deps::{
    CapabilityError, HttpFetcher, InferenceClient, JournalStore, ResolvedDependencies,
};
use crate::resilience::{CircuitError, Classify, FailureKind};

// =============================================================================
// Handler errors
// =============================================================================

/// Error a handler may return.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The caller's arguments were unusable. Message is caller-safe.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller referenced something that does not exist. Message is caller-safe.
    #[error("not found: {0}")]
    NotFound(String),

    /// A capability call failed.
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    /// A circuit breaker used inside the handler rejected the call.
    #[error("circuit '{name}' is open, retry after {time_remaining:.1}s")]
    CircuitOpen { name: String, time_remaining: f64 },

    /// Anything else.
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

impl Classify for ToolError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            ToolError::InvalidArgument(_) => FailureKind::InvalidInput,
            ToolError::NotFound(_) => FailureKind::NotFound,
            ToolError::Capability(err) => err.failure_kind(),
            // Another breaker already counted this
            ToolError::CircuitOpen { .. } => FailureKind::Internal,
            ToolError::Failed(_) => FailureKind::Internal,
        }
    }
}

impl<E> From<CircuitError<E>> for ToolError
where
    E: Into<ToolError>,
{
    fn from(err: CircuitError<E>) -> Self {
        match err {
            CircuitError::Open {
                name,
                time_remaining,
            } => ToolError::CircuitOpen {
                name,
                time_remaining,
            },
            CircuitError::Inner(inner) => inner.into(),
        }
    }
}

// =============================================================================
// Call context
// =============================================================================

/// Everything a handler receives besides its arguments.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub call_id: Uuid,
    pub caller: CallerIdentity,
    deps: ResolvedDependencies,
}

impl ToolContext {
    pub fn new(call_id: Uuid, caller: CallerIdentity, deps: ResolvedDependencies) -> Self {
        Self {
            call_id,
            caller,
            deps,
        }
    }

    /// The implicit `user_id` every handler gets.
    pub fn user_id(&self) -> &str {
        &self.caller.user_id
    }

    pub fn deps(&self) -> &ResolvedDependencies {
        &self.deps
    }

    pub fn store(&self, name: &str) -> Result<Arc<dyn JournalStore>, ToolError> {
        self.deps
            .store(name)
            .ok_or_else(|| missing_dependency(name, "store"))
    }

    pub fn inference(&self, name: &str) -> Result<Arc<dyn InferenceClient>, ToolError> {
        self.deps
            .inference(name)
            .ok_or_else(|| missing_dependency(name, "inference"))
    }

    pub fn http(&self, name: &str) -> Result<Arc<dyn HttpFetcher>, ToolError> {
        self.deps
            .http(name)
            .ok_or_else(|| missing_dependency(name, "http"))
    }
}

fn missing_dependency(name: &str, kind: &str) -> ToolError {
    ToolError::failed(format!("dependency '{}' ({}) was not injected", name, kind))
}

// =============================================================================
// Handler contract
// =============================================================================

/// An invocable tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Declared parameters, including injected ones and optionally `user_id`.
    fn parameters(&self) -> Vec<ParamDef>;

    async fn call(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<Value, ToolError>;
}

/// Handler built from a closure.
pub struct FnHandler<F> {
    params: Vec<ParamDef>,
    func: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolContext, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    fn parameters(&self) -> Vec<ParamDef> {
        self.params.clone()
    }

    async fn call(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<Value, ToolError> {
        (self.func)(ctx, args).await
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F, Fut>(params: Vec<ParamDef>, func: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolContext, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(FnHandler { params, func })
}

// =============================================================================
// Argument helpers
// =============================================================================

pub fn str_arg(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::invalid(format!("missing string argument: {}", key)))
}

pub fn int_arg(args: &Map<String, Value>, key: &str) -> Result<i64, ToolError> {
    args.get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ToolError::invalid(format!("missing integer argument: {}", key)))
}

pub fn opt_int_arg(args: &Map<String, Value>, key: &str) -> Option<i64> {
    args.get(key).and_then(|v| v.as_i64())
}

pub fn str_list_arg(args: &Map<String, Value>, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_kinds() {
        assert_eq!(ToolError::invalid("x").failure_kind(), FailureKind::InvalidInput);
        assert_eq!(
            ToolError::from(CapabilityError::Timeout("slow".into())).failure_kind(),
            FailureKind::Timeout
        );
        assert_eq!(ToolError::failed("boom").failure_kind(), FailureKind::Internal);
    }

    #[test]
    fn test_circuit_error_conversion() {
        let open: CircuitError<CapabilityError> = CircuitError::Open {
            name: "inference".into(),
            time_remaining: 12.0,
        };
        assert!(matches!(
            ToolError::from(open),
            ToolError::CircuitOpen { time_remaining, .. } if time_remaining == 12.0
        ));

        let inner: CircuitError<CapabilityError> = CircuitError::Inner(CapabilityError::Throttled);
        assert!(matches!(
            ToolError::from(inner),
            ToolError::Capability(CapabilityError::Throttled)
        ));
    }

    #[tokio::test]
    async fn test_fn_handler_calls_closure() {
        let handler = handler_fn(vec![ParamDef::new("text", ParamType::String)], |ctx, args| async move {
            Ok::<_, ToolError>(json!({"echo": str_arg(&args, "text")?, "user": ctx.user_id()}))
        });
        assert_eq!(handler.parameters().len(), 1);

        let ctx = ToolContext::new(
            Uuid::new_v4(),
            CallerIdentity::user("alice"),
            ResolvedDependencies::default(),
        );
        let args = json!({"text": "hi"}).as_object().cloned().unwrap();
        let out = handler.call(ctx, args).await.unwrap();
        assert_eq!(out, json!({"echo": "hi", "user": "alice"}));
    }

    #[test]
    fn test_missing_dependency_is_error() {
        let ctx = ToolContext::new(
            Uuid::new_v4(),
            CallerIdentity::user("alice"),
            ResolvedDependencies::default(),
        );
        assert!(matches!(ctx.store("store"), Err(ToolError::Failed(_))));
    }

    #[test]
    fn test_arg_helpers() {
        let args = json!({"n": 3, "s": "x", "tags": ["a", 1, "b"]})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(int_arg(&args, "n").unwrap(), 3);
        assert!(int_arg(&args, "s").is_err());
        assert_eq!(opt_int_arg(&args, "missing"), None);
        assert_eq!(str_list_arg(&args, "tags"), vec!["a", "b"]);
    }
}
