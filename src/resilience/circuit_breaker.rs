//! Per-upstream failure isolation.
//!
//! Closed → Open after `failure_threshold` countable failures; Open rejects
//! until `recovery_timeout` has passed since the last failure; the next
//! admission moves to HalfOpen and lets up to `half_open_max_calls` trial calls
//! through. One failed trial reopens, `half_open_max_calls` successful trials
//! close the circuit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::clock::{seconds_between, Clock, SystemClock};
use crate::types::{Error, Result};

// =============================================================================
// Failure classification
// =============================================================================

/// Coarse classification of a failed upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Request timed out.
    Timeout,
    /// Could not connect / connection dropped.
    Connection,
    /// Upstream answered with a server-side error.
    Upstream,
    /// Upstream throttled us.
    Throttled,
    /// Upstream answered with something we could not decode.
    Decode,
    /// The caller's input was rejected.
    InvalidInput,
    /// The requested record does not exist.
    NotFound,
    /// Anything else raised by handler code.
    Internal,
}

/// Errors that can be classified for circuit breaking.
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

// =============================================================================
// Configuration
// =============================================================================

/// Breaker thresholds for one upstream resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    /// Failure kinds that count against the upstream. Everything else passes
    /// through without touching the counters.
    pub countable: Vec<FailureKind>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            countable: vec![
                FailureKind::Timeout,
                FailureKind::Connection,
                FailureKind::Upstream,
            ],
        }
    }
}

impl CircuitConfig {
    pub fn counts(&self, kind: FailureKind) -> bool {
        self.countable.contains(&kind)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::config(format!("circuit '{}': failure_threshold must be > 0", name)));
        }
        if self.half_open_max_calls == 0 {
            return Err(Error::config(format!(
                "circuit '{}': half_open_max_calls must be > 0",
                name
            )));
        }
        Ok(())
    }
}

/// Default breaker config plus per-resource entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub default: CircuitConfig,
    pub resources: HashMap<String, CircuitConfig>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        let inference = CircuitConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 2,
            countable: vec![
                FailureKind::Timeout,
                FailureKind::Connection,
                FailureKind::Upstream,
                FailureKind::Throttled,
            ],
        };
        let http = CircuitConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            countable: vec![
                FailureKind::Timeout,
                FailureKind::Connection,
                FailureKind::Upstream,
            ],
        };
        let store = CircuitConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(15),
            half_open_max_calls: 1,
            countable: vec![FailureKind::Timeout, FailureKind::Connection],
        };

        Self {
            default: CircuitConfig::default(),
            resources: [("inference", inference), ("http", http), ("store", store)]
                .into_iter()
                .map(|(name, config)| (name.to_string(), config))
                .collect(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn config_for(&self, name: &str) -> CircuitConfig {
        self.resources
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn with_resource(mut self, name: impl Into<String>, config: CircuitConfig) -> Self {
        self.resources.insert(name.into(), config);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.default.validate("default")?;
        for (name, config) in &self.resources {
            config.validate(name)?;
        }
        Ok(())
    }
}

// =============================================================================
// State
// =============================================================================

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure_time: Option<DateTime<Utc>>,
    /// Bumped on every state change so stale permits can't touch a newer phase.
    generation: u64,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure_time: None,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.success_count = 0;
        self.half_open_calls = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
        self.generation += 1;
    }
}

/// Operational snapshot of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    pub half_open_max_calls: u32,
    pub time_remaining: f64,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// Outcome of a call through the breaker.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Rejected without running the operation.
    #[error("circuit '{name}' is open, retry after {time_remaining:.1}s")]
    Open { name: String, time_remaining: f64 },
    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Open { .. } => None,
        }
    }
}

// =============================================================================
// Breaker
// =============================================================================

/// Circuit breaker guarding one upstream resource.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    record: Mutex<BreakerRecord>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            record: Mutex::new(BreakerRecord::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Admission check. `Err(time_remaining)` when rejected.
    fn admit(&self) -> std::result::Result<Admission, f64> {
        let mut record = self.lock();
        let now = self.clock.now();
        match record.state {
            CircuitState::Closed => Ok(Admission {
                generation: record.generation,
                trial: false,
            }),
            CircuitState::Open => {
                let remaining = self.remaining_locked(&record, now);
                if remaining > 0.0 {
                    return Err(remaining);
                }
                record.transition(CircuitState::HalfOpen);
                record.half_open_calls = 1;
                tracing::info!(circuit = %self.name, "circuit half-open, admitting trial calls");
                Ok(Admission {
                    generation: record.generation,
                    trial: true,
                })
            }
            CircuitState::HalfOpen => {
                if record.half_open_calls < self.config.half_open_max_calls {
                    record.half_open_calls += 1;
                    Ok(Admission {
                        generation: record.generation,
                        trial: true,
                    })
                } else {
                    Err(0.0)
                }
            }
        }
    }

    fn remaining_locked(&self, record: &BreakerRecord, now: DateTime<Utc>) -> f64 {
        if record.state != CircuitState::Open {
            return 0.0;
        }
        let elapsed = record
            .last_failure_time
            .map(|at| seconds_between(at, now))
            .unwrap_or(f64::MAX);
        (self.config.recovery_timeout.as_secs_f64() - elapsed).max(0.0)
    }

    /// Whether a call may proceed now. May move Open → HalfOpen, and in
    /// HalfOpen consumes one trial slot; the caller must follow up with
    /// `record_success` or `record_failure`.
    pub fn can_execute(&self) -> bool {
        self.admit().is_ok()
    }

    /// Admission that hands back a guard. Dropping the guard unsettled
    /// returns an unused HalfOpen trial slot and records nothing.
    pub fn acquire(&self) -> std::result::Result<CircuitPermit<'_>, Error> {
        match self.admit() {
            Ok(admission) => Ok(CircuitPermit {
                breaker: self,
                admission,
                settled: false,
            }),
            Err(time_remaining) => Err(Error::circuit_open(self.name.clone(), time_remaining)),
        }
    }

    /// Record a success against the current phase.
    pub fn record_success(&self) {
        self.settle_success(None);
    }

    /// Record a countable failure against the current phase.
    pub fn record_failure(&self) {
        self.settle_failure(None);
    }

    /// Results admitted under an older generation belong to a finished phase
    /// and are dropped.
    fn is_stale(&self, record: &BreakerRecord, generation: Option<u64>) -> bool {
        match generation {
            Some(generation) if generation != record.generation => {
                tracing::debug!(
                    circuit = %self.name,
                    admitted = generation,
                    current = record.generation,
                    "ignoring result from an earlier phase"
                );
                true
            }
            _ => false,
        }
    }

    fn settle_success(&self, generation: Option<u64>) {
        let mut record = self.lock();
        if self.is_stale(&record, generation) {
            return;
        }
        match record.state {
            CircuitState::Closed => record.failure_count = 0,
            CircuitState::HalfOpen => {
                record.success_count += 1;
                if record.success_count >= self.config.half_open_max_calls {
                    record.transition(CircuitState::Closed);
                    tracing::info!(circuit = %self.name, "circuit closed");
                }
            }
            // Late success from a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    fn settle_failure(&self, generation: Option<u64>) {
        let mut record = self.lock();
        if self.is_stale(&record, generation) {
            return;
        }
        let now = self.clock.now();
        match record.state {
            CircuitState::Closed => {
                record.failure_count += 1;
                record.last_failure_time = Some(now);
                if record.failure_count >= self.config.failure_threshold {
                    record.transition(CircuitState::Open);
                    tracing::warn!(
                        circuit = %self.name,
                        failures = record.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                record.last_failure_time = Some(now);
                record.transition(CircuitState::Open);
                record.failure_count = 0;
                tracing::warn!(circuit = %self.name, "trial call failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut record = self.lock();
        if record.state == CircuitState::HalfOpen && record.generation == generation {
            record.half_open_calls = record.half_open_calls.saturating_sub(1);
        }
    }

    /// Seconds until an Open circuit admits a trial call (0 otherwise).
    pub fn get_time_remaining(&self) -> f64 {
        let record = self.lock();
        self.remaining_locked(&record, self.clock.now())
    }

    pub fn get_status(&self) -> CircuitStatus {
        let record = self.lock();
        let now = self.clock.now();
        CircuitStatus {
            name: self.name.clone(),
            state: record.state,
            failure_count: record.failure_count,
            success_count: record.success_count,
            half_open_calls: record.half_open_calls,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs_f64(),
            half_open_max_calls: self.config.half_open_max_calls,
            time_remaining: self.remaining_locked(&record, now),
            last_failure_time: record.last_failure_time,
        }
    }

    /// Force back to Closed with zeroed counters.
    pub fn reset(&self) {
        let mut record = self.lock();
        record.transition(CircuitState::Closed);
        record.last_failure_time = None;
    }

    /// Run `operation` under the breaker.
    ///
    /// Countable failures are recorded and returned; non-countable failures
    /// pass through without touching the counters.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify,
    {
        let permit = self.acquire().map_err(|err| match err {
            Error::CircuitOpen {
                name,
                time_remaining,
            } => CircuitError::Open {
                name,
                time_remaining,
            },
            _ => CircuitError::Open {
                name: self.name.clone(),
                time_remaining: 0.0,
            },
        })?;

        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                let kind = err.failure_kind();
                if self.config.counts(kind) {
                    permit.failure();
                } else {
                    tracing::debug!(circuit = %self.name, ?kind, "failure not countable");
                }
                Err(CircuitError::Inner(err))
            }
        }
    }
}

/// Phase a call was admitted under.
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    trial: bool,
}

/// Admission guard returned by [`CircuitBreaker::acquire`].
///
/// Settles against the phase it was admitted in; once the breaker has moved
/// on, its result is ignored.
#[derive(Debug)]
#[must_use]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle_success(Some(self.admission.generation));
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle_failure(Some(self.admission.generation));
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission.trial {
            self.breaker.release_trial(self.admission.generation);
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Process-lifetime breakers keyed by upstream resource name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Existing breaker for `name`, or a new one built from its config.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(circuit = name, "creating circuit breaker");
                Arc::new(CircuitBreaker::with_clock(
                    name,
                    self.config.config_for(name),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// Reset one breaker. Returns false when it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Status of every breaker, sorted by name.
    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut statuses: Vec<CircuitStatus> = breakers.iter().map(|b| b.get_status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
