//! Dispatch integration tests: admission, breaking and recording through the public API.

use platewise_core::clock::ManualClock;
use platewise_core::deps::CapabilityError;
use platewise_core::dispatch::{Dispatcher, ExecutionStatus, FanoutSink, ToolMetrics, TracingSink};
use platewise_core::resilience::{CircuitState, RateLimitConfig, RateLimitRule};
use platewise_core::tools::{
    handler_fn, str_arg, CallerIdentity, ParamDef, ParamType, ToolDescriptor, ToolError,
    ToolRegistry,
};
use platewise_core::Config;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn echo_tool() -> ToolDescriptor {
    let handler = handler_fn(
        vec![ParamDef::new("text", ParamType::String)],
        |_ctx, args| async move { Ok::<_, ToolError>(json!({"echo": str_arg(&args, "text")?})) },
    );
    ToolDescriptor::builder("echo", handler)
        .description("Echo text back")
        .build()
}

/// Tool behind the `flaky` breaker that times out while `failing` is set.
fn flaky_tool(calls: Arc<AtomicUsize>, failing: Arc<AtomicBool>) -> ToolDescriptor {
    let handler = handler_fn(Vec::new(), move |_ctx, _args| {
        let calls = calls.clone();
        let failing = failing.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if failing.load(Ordering::SeqCst) {
                Err(ToolError::from(CapabilityError::Timeout("upstream slow".into())))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    });
    ToolDescriptor::builder("flaky.fetch", handler)
        .protected_by("flaky")
        .build()
}

fn dispatcher(tools: Vec<ToolDescriptor>, config: &Config, clock: Arc<ManualClock>) -> Dispatcher {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    Dispatcher::builder(Arc::new(registry))
        .config(config)
        .clock(clock)
        .build()
}

#[tokio::test]
async fn test_rate_limit_window_slides() {
    let mut config = Config::default();
    config.rate_limits = RateLimitConfig::uniform(RateLimitRule::per_minute(2));
    let clock = Arc::new(ManualClock::starting_now());
    let dispatcher = dispatcher(vec![echo_tool()], &config, clock.clone());
    let caller = CallerIdentity::user("alice");

    for _ in 0..2 {
        let result = dispatcher.dispatch("echo", args(json!({"text": "hi"})), &caller).await;
        assert_eq!(result.status, ExecutionStatus::Success);
    }

    let limited = dispatcher.dispatch("echo", args(json!({"text": "hi"})), &caller).await;
    assert_eq!(limited.status, ExecutionStatus::RateLimited);
    let retry_after = limited.retry_after.unwrap();
    assert!(retry_after > 0.0 && retry_after <= 60.0, "retry_after = {}", retry_after);
    assert_eq!(limited.to_envelope()["status"], "rate_limited");

    clock.advance(Duration::from_secs(61));
    let after = dispatcher.dispatch("echo", args(json!({"text": "again"})), &caller).await;
    assert_eq!(after.payload, Some(json!({"echo": "again"})));
}

#[tokio::test]
async fn test_breaker_stops_calling_failing_upstream() {
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = Arc::new(AtomicBool::new(true));
    let clock = Arc::new(ManualClock::starting_now());
    let dispatcher = dispatcher(
        vec![flaky_tool(calls.clone(), failing)],
        &Config::default(),
        clock,
    );
    let caller = CallerIdentity::user("alice");

    for _ in 0..5 {
        let result = dispatcher.dispatch("flaky.fetch", Map::new(), &caller).await;
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error_code.as_deref(), Some("handler_error"));
    }

    let blocked = dispatcher.dispatch("flaky.fetch", Map::new(), &caller).await;
    assert_eq!(blocked.status, ExecutionStatus::CircuitOpen);
    assert!(blocked.retry_after.unwrap() > 0.0);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let breaker = dispatcher.circuit_breakers().get("flaky").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn test_breaker_recovers_through_half_open_trial() {
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = Arc::new(AtomicBool::new(true));
    let clock = Arc::new(ManualClock::starting_now());
    let dispatcher = dispatcher(
        vec![flaky_tool(calls.clone(), failing.clone())],
        &Config::default(),
        clock.clone(),
    );
    let caller = CallerIdentity::user("alice");

    for _ in 0..5 {
        dispatcher.dispatch("flaky.fetch", Map::new(), &caller).await;
    }
    let breaker = dispatcher.circuit_breakers().get("flaky").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    // Upstream recovers; the cooldown elapses
    failing.store(false, Ordering::SeqCst);
    clock.advance(Duration::from_secs(31));

    let trial = dispatcher.dispatch("flaky.fetch", Map::new(), &caller).await;
    assert_eq!(trial.status, ExecutionStatus::Success);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_every_outcome_has_status_envelope() {
    let clock = Arc::new(ManualClock::starting_now());
    let dispatcher = dispatcher(vec![echo_tool()], &Config::default(), clock);
    let caller = CallerIdentity::user("alice");

    let outcomes = [
        dispatcher.dispatch("echo", args(json!({"text": "x"})), &caller).await,
        dispatcher.dispatch("echo", Map::new(), &caller).await,
        dispatcher.dispatch("missing.tool", Map::new(), &caller).await,
    ];
    let statuses: Vec<Value> = outcomes.iter().map(|r| r.to_envelope()["status"].clone()).collect();
    assert_eq!(statuses, vec![json!("success"), json!("error"), json!("error")]);
    assert_eq!(outcomes[1].error_code.as_deref(), Some("invalid_arguments"));
    assert_eq!(outcomes[2].error_code.as_deref(), Some("unknown_tool"));
}

#[tokio::test]
async fn test_metrics_sink_aggregates_outcomes() {
    let metrics = Arc::new(ToolMetrics::default());
    let sink = FanoutSink::new(Vec::new())
        .with(Arc::new(TracingSink))
        .with(metrics.clone());

    let mut registry = ToolRegistry::new();
    registry.register(echo_tool()).unwrap();
    let dispatcher = Dispatcher::builder(Arc::new(registry))
        .sink(Arc::new(sink))
        .build();
    let caller = CallerIdentity::user("alice");

    dispatcher.dispatch("echo", args(json!({"text": "a"})), &caller).await;
    dispatcher.dispatch("echo", args(json!({"text": "b"})), &caller).await;
    dispatcher.dispatch("echo", Map::new(), &caller).await;

    let snapshot = metrics.snapshot("echo").unwrap();
    assert_eq!(snapshot.calls, 3);
    assert!((snapshot.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(snapshot.by_status.get("success"), Some(&2));
    assert_eq!(snapshot.by_status.get("error"), Some(&1));
    assert_eq!(metrics.summary().total_calls, 3);
}

#[tokio::test]
async fn test_concurrent_calls_respect_budget() {
    let mut config = Config::default();
    config.rate_limits = RateLimitConfig::uniform(RateLimitRule::per_minute(5));
    let clock = Arc::new(ManualClock::starting_now());
    let dispatcher = Arc::new(dispatcher(vec![echo_tool()], &config, clock));

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(
                        "echo",
                        args(json!({"text": format!("call {}", i)})),
                        &CallerIdentity::user("alice"),
                    )
                    .await
            })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().status == ExecutionStatus::Success {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
}
