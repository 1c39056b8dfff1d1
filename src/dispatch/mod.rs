//! Dispatcher: the single entry point for tool calls.
//!
//! Every call runs the same pipeline: admission, lookup, access, argument
//! validation, dependency resolution, (breaker-guarded) invocation, result
//! wrapping. Whatever happens, the caller gets a [`ToolExecutionResult`] and
//! the sink gets exactly one [`ExecutionRecord`].

pub mod metrics;
pub mod record;
pub mod result;

pub use metrics::{MetricsSummary, ToolMetrics, ToolSnapshot};
pub use record::{truncate_arguments, ExecutionRecord, ExecutionSink, FanoutSink, TracingSink};
pub use result::{ExecutionStatus, ToolExecutionResult};

use futures::FutureExt;
use serde_json::{Map, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::deps::{resolve_dependencies, DependencyContainer};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RateLimitConfig, RateLimiter};
use crate::tools::schema::{fill_defaults, validate_arguments};
use crate::tools::{check_access, CallerIdentity, ToolContext, ToolDescriptor, ToolError, ToolRegistry};
use crate::types::{CapabilityConfig, Config, DispatchConfig, Error};

/// Envelope message for failures whose details stay in the logs.
const GENERIC_FAILURE: &str = "Tool execution failed";

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`Dispatcher`]. Components not supplied are built from config.
pub struct DispatcherBuilder {
    registry: Arc<ToolRegistry>,
    limiter: Option<Arc<RateLimiter>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    container: Option<Arc<DependencyContainer>>,
    sink: Option<Arc<dyn ExecutionSink>>,
    clock: Option<Arc<dyn Clock>>,
    rate_limits: RateLimitConfig,
    circuit_breakers: CircuitBreakerConfig,
    capabilities: CapabilityConfig,
    dispatch: DispatchConfig,
}

impl std::fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("tools", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl DispatcherBuilder {
    /// Take limits, breaker settings, capability and dispatch settings from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.rate_limits = config.rate_limits.clone();
        self.circuit_breakers = config.circuit_breakers.clone();
        self.capabilities = config.capabilities.clone();
        self.dispatch = config.dispatch.clone();
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn circuit_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn container(mut self, container: Arc<DependencyContainer>) -> Self {
        self.container = Some(container);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ExecutionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Clock for components built here and for record timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn max_logged_argument_chars(mut self, max_chars: usize) -> Self {
        self.dispatch.max_logged_argument_chars = max_chars;
        self
    }

    pub fn build(self) -> Dispatcher {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::with_clock(self.rate_limits, clock.clone())));
        let breakers = self.breakers.unwrap_or_else(|| {
            Arc::new(CircuitBreakerRegistry::with_clock(
                self.circuit_breakers,
                clock.clone(),
            ))
        });
        let container = self
            .container
            .unwrap_or_else(|| Arc::new(DependencyContainer::new(self.capabilities)));
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));

        Dispatcher {
            registry: self.registry,
            limiter,
            breakers,
            container,
            sink,
            clock,
            max_logged_argument_chars: self.dispatch.max_logged_argument_chars,
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Shared, immutable call pipeline. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    container: Arc<DependencyContainer>,
    sink: Arc<dyn ExecutionSink>,
    clock: Arc<dyn Clock>,
    max_logged_argument_chars: usize,
}

/// Result plus the internal detail that goes to the record but not the caller.
struct Outcome {
    result: ToolExecutionResult,
    detail: Option<String>,
}

impl From<ToolExecutionResult> for Outcome {
    fn from(result: ToolExecutionResult) -> Self {
        Self {
            result,
            detail: None,
        }
    }
}

impl Dispatcher {
    pub fn builder(registry: Arc<ToolRegistry>) -> DispatcherBuilder {
        DispatcherBuilder {
            registry,
            limiter: None,
            breakers: None,
            container: None,
            sink: None,
            clock: None,
            rate_limits: RateLimitConfig::default(),
            circuit_breakers: CircuitBreakerConfig::default(),
            capabilities: CapabilityConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn container(&self) -> &Arc<DependencyContainer> {
        &self.container
    }

    /// Run one tool call. Never fails and never panics.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
        caller: &CallerIdentity,
    ) -> ToolExecutionResult {
        let call_id = Uuid::new_v4();
        let pending = PendingRecord::new(
            self.sink.as_ref(),
            ExecutionRecord {
                tool: tool_name.to_string(),
                call_id,
                user_id: caller.user_id.clone(),
                started_at: self.clock.now(),
                duration_seconds: 0.0,
                status: ExecutionStatus::Error,
                arguments: truncate_arguments(&arguments, self.max_logged_argument_chars),
                error: None,
            },
        );

        let outcome = self.execute(tool_name, arguments, caller, call_id).await;
        let result = outcome.result.with_duration(pending.elapsed());
        pending.finish(&result, outcome.detail);
        result
    }

    async fn execute(
        &self,
        tool_name: &str,
        mut args: Map<String, Value>,
        caller: &CallerIdentity,
        call_id: Uuid,
    ) -> Outcome {
        // Admission
        if let Err(err) = self.limiter.check_and_record(tool_name) {
            let retry_after = err.retry_after().unwrap_or(0.0);
            return ToolExecutionResult::rate_limited(err.to_string(), retry_after).into();
        }

        // Lookup
        let Some(descriptor) = self.registry.get(tool_name) else {
            return ToolExecutionResult::error(
                Error::unknown_tool(tool_name).to_string(),
                Some("unknown_tool"),
            )
            .into();
        };

        // Access and arguments
        if let Err(err) = check_access(caller, &descriptor) {
            return ToolExecutionResult::error(err.to_string(), Some("permission_denied")).into();
        }
        let problems = validate_arguments(&descriptor.params, &descriptor.dependency_names, &args);
        if !problems.is_empty() {
            let err = Error::validation(problems.join("; "));
            return ToolExecutionResult::error(err.to_string(), Some("invalid_arguments")).into();
        }
        fill_defaults(&descriptor.params, &mut args);

        // Dependencies
        let deps = resolve_dependencies(&descriptor.params, Some(self.container.as_ref()));
        let ctx = ToolContext::new(call_id, caller.clone(), deps);

        tracing::debug!(tool = tool_name, %call_id, "invoking handler");
        let invocation = self.invoke(&descriptor, ctx, args);
        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(payload)) => ToolExecutionResult::success(payload).into(),
            Ok(Err(err)) => handler_failure(tool_name, err),
            Err(panic) => {
                let detail = Error::handler(panic_message(panic.as_ref())).to_string();
                tracing::error!(tool = tool_name, %call_id, error = %detail, "handler panicked");
                Outcome {
                    result: ToolExecutionResult::error(GENERIC_FAILURE, Some("internal_error")),
                    detail: Some(detail),
                }
            }
        }
    }

    async fn invoke(
        &self,
        descriptor: &ToolDescriptor,
        ctx: ToolContext,
        args: Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let handler = descriptor.handler.clone();
        match &descriptor.protected_by {
            Some(resource) => {
                let breaker = self.breakers.get_or_create(resource);
                breaker
                    .call(|| handler.call(ctx, args))
                    .await
                    .map_err(ToolError::from)
            }
            None => handler.call(ctx, args).await,
        }
    }
}

fn handler_failure(tool_name: &str, err: ToolError) -> Outcome {
    match err {
        ToolError::CircuitOpen {
            name,
            time_remaining,
        } => {
            let message = Error::circuit_open(name, time_remaining).to_string();
            ToolExecutionResult::circuit_open(message, time_remaining).into()
        }
        ToolError::InvalidArgument(message) => {
            ToolExecutionResult::error(message, Some("invalid_arguments")).into()
        }
        ToolError::NotFound(message) => ToolExecutionResult::error(message, Some("not_found")).into(),
        other => {
            let detail = Error::handler(other.to_string()).to_string();
            tracing::error!(tool = tool_name, error = %detail, "handler failed");
            Outcome {
                result: ToolExecutionResult::error(GENERIC_FAILURE, Some("handler_error")),
                detail: Some(detail),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

// =============================================================================
// Record emission
// =============================================================================

/// Emits the call record on drop, so a cancelled call is recorded too.
struct PendingRecord<'a> {
    sink: &'a dyn ExecutionSink,
    record: Option<ExecutionRecord>,
    started: Instant,
    finished: bool,
}

impl<'a> PendingRecord<'a> {
    fn new(sink: &'a dyn ExecutionSink, mut record: ExecutionRecord) -> Self {
        record.error = Some("call cancelled".to_string());
        Self {
            sink,
            record: Some(record),
            started: Instant::now(),
            finished: false,
        }
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn finish(mut self, result: &ToolExecutionResult, detail: Option<String>) {
        if let Some(record) = self.record.as_mut() {
            record.status = result.status;
            record.duration_seconds = result.duration_seconds;
            record.error = detail.or_else(|| result.error_message.clone());
        }
        self.finished = true;
    }
}

impl Drop for PendingRecord<'_> {
    fn drop(&mut self) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        if !self.finished {
            record.duration_seconds = self.elapsed();
        }
        let sink = self.sink;
        if std::panic::catch_unwind(AssertUnwindSafe(|| sink.record(&record))).is_err() {
            tracing::error!(tool = %record.tool, "execution sink panicked");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
