//! Per-tool admission control.
//!
//! Sliding window rate limiter: each tool keeps the timestamps of its admitted
//! calls within the trailing window. Purge, check and record happen under one
//! lock so concurrent callers can never both be admitted past the limit.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::types::{Error, Result};

/// Budget for one tool: at most `max_calls` within `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_calls: usize,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self { max_calls, window }
    }

    pub fn per_minute(max_calls: usize) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }
}

/// Default budget plus explicit per-tool overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default: RateLimitRule,
    pub overrides: HashMap<String, RateLimitRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // AI-backed tools are far more expensive than data access
        let overrides = [
            ("profile.synthesize", RateLimitRule::per_minute(10)),
            ("nutrition.estimate", RateLimitRule::per_minute(20)),
            ("journal.log_meal", RateLimitRule::per_minute(30)),
            ("journal.search", RateLimitRule::per_minute(60)),
        ]
        .into_iter()
        .map(|(name, rule)| (name.to_string(), rule))
        .collect();

        Self {
            default: RateLimitRule::per_minute(60),
            overrides,
        }
    }
}

impl RateLimitConfig {
    /// Config with only a default rule.
    pub fn uniform(default: RateLimitRule) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, tool_name: impl Into<String>, rule: RateLimitRule) -> Self {
        self.overrides.insert(tool_name.into(), rule);
        self
    }

    pub fn rule_for(&self, tool_name: &str) -> RateLimitRule {
        self.overrides
            .get(tool_name)
            .copied()
            .unwrap_or(self.default)
    }

    pub fn validate(&self) -> Result<()> {
        let rules = std::iter::once(("default", &self.default))
            .chain(self.overrides.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, rule) in rules {
            if rule.max_calls == 0 {
                return Err(Error::config(format!("rate limit '{}': max_calls must be > 0", name)));
            }
            if rule.window.is_zero() {
                return Err(Error::config(format!("rate limit '{}': window must be > 0", name)));
            }
        }
        Ok(())
    }
}

/// Sliding window for one tool.
#[derive(Debug, Default)]
struct SlidingWindow {
    timestamps: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    /// Drop timestamps older than `now - window`.
    fn purge(&mut self, now: DateTime<Utc>, window: ChronoDuration) {
        let cutoff = now - window;
        while let Some(&ts) = self.timestamps.front() {
            if ts < cutoff {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn check_and_record(
        &mut self,
        tool_name: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let window = to_chrono(rule.window);
        self.purge(now, window);

        if self.timestamps.len() >= rule.max_calls {
            let retry_after = self
                .timestamps
                .front()
                .map(|&oldest| retry_after_secs(now, oldest + window))
                .unwrap_or_else(|| rule.window.as_secs_f64());
            return Err(Error::RateLimitExceeded {
                tool: tool_name.to_string(),
                limit: rule.max_calls,
                window_secs: rule.window.as_secs(),
                retry_after,
            });
        }

        self.timestamps.push_back(now);
        Ok(())
    }
}

fn to_chrono(window: Duration) -> ChronoDuration {
    ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

/// Seconds until `expires`, rounded up to whole milliseconds and never below
/// one millisecond.
fn retry_after_secs(now: DateTime<Utc>, expires: DateTime<Utc>) -> f64 {
    let micros = (expires - now).num_microseconds().unwrap_or(i64::MAX).max(0);
    let millis = micros.saturating_add(999) / 1000;
    millis.max(1) as f64 / 1000.0
}

/// Idle windows are swept at most this often.
const SWEEP_INTERVAL_SECS: i64 = 60;

/// Windows keyed by tool name, plus sweep bookkeeping.
#[derive(Debug, Default)]
struct WindowTable {
    windows: HashMap<String, SlidingWindow>,
    last_sweep: Option<DateTime<Utc>>,
}

impl WindowTable {
    /// Drop windows with no timestamps left inside their rule's window.
    fn sweep(&mut self, config: &RateLimitConfig, now: DateTime<Utc>) {
        let interval = ChronoDuration::seconds(SWEEP_INTERVAL_SECS);
        if matches!(self.last_sweep, Some(at) if now - at < interval) {
            return;
        }
        self.last_sweep = Some(now);
        let before = self.windows.len();
        self.windows.retain(|name, window| {
            window.purge(now, to_chrono(config.rule_for(name).window));
            !window.timestamps.is_empty()
        });
        let evicted = before - self.windows.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.windows.len(), "swept idle rate windows");
        }
    }
}

/// Rate limiter - enforces per-tool call budgets.
///
/// Shared by reference between concurrent dispatches. The window table sits
/// behind one `std::sync::Mutex`; the lock is never held across an `.await`.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    table: Mutex<WindowTable>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            table: Mutex::new(WindowTable::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Effective budget for a tool.
    pub fn limit_for(&self, tool_name: &str) -> RateLimitRule {
        self.config.rule_for(tool_name)
    }

    /// Admit one call for `tool_name`, or fail with `RateLimitExceeded`.
    pub fn check_and_record(&self, tool_name: &str) -> Result<()> {
        let rule = self.limit_for(tool_name);
        let mut table = self.lock();
        // Read inside the lock so timestamps enter each window in order
        let now = self.clock.now();
        table.sweep(&self.config, now);
        let result = table
            .windows
            .entry(tool_name.to_string())
            .or_default()
            .check_and_record(tool_name, rule, now);

        match &result {
            Ok(()) => tracing::debug!(tool = tool_name, "admitted"),
            Err(err) => tracing::debug!(tool = tool_name, error = %err, "admission rejected"),
        }
        result
    }

    /// Calls still available in the current window.
    pub fn get_remaining(&self, tool_name: &str) -> usize {
        let rule = self.limit_for(tool_name);
        let mut table = self.lock();
        let now = self.clock.now();
        let used = match table.windows.get_mut(tool_name) {
            Some(window) => {
                window.purge(now, to_chrono(rule.window));
                window.timestamps.len()
            }
            None => 0,
        };
        if used == 0 {
            table.windows.remove(tool_name);
        }
        rule.max_calls.saturating_sub(used)
    }

    /// Clear one tool's window, or every window when `tool_name` is `None`.
    pub fn reset(&self, tool_name: Option<&str>) {
        let mut table = self.lock();
        match tool_name {
            Some(name) => {
                table.windows.remove(name);
            }
            None => table.windows.clear(),
        }
    }

    #[cfg(test)]
    fn stored_timestamps(&self, tool_name: &str) -> usize {
        self.lock()
            .windows
            .get(tool_name)
            .map(|w| w.timestamps.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn tracked_tools(&self) -> usize {
        self.lock().windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max_calls: usize, window_secs: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let config = RateLimitConfig::uniform(RateLimitRule::new(
            max_calls,
            Duration::from_secs(window_secs),
        ));
        (RateLimiter::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn test_admits_up_to_limit_then_rejects() {
        let (limiter, clock) = limiter(3, 60);
        for _ in 0..3 {
            limiter.check_and_record("echo").unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let err = limiter.check_and_record("echo").unwrap_err();
        match err {
            Error::RateLimitExceeded {
                limit,
                window_secs,
                retry_after,
                ..
            } => {
                assert_eq!(limit, 3);
                assert_eq!(window_secs, 60);
                // oldest was 3s ago
                assert!((retry_after - 57.0).abs() < 1e-9, "retry_after = {}", retry_after);
                assert!(retry_after > 0.0 && retry_after <= 60.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_retry_after_stays_positive_at_window_edge() {
        let (limiter, clock) = limiter(1, 60);
        limiter.check_and_record("echo").unwrap();
        clock.advance(Duration::from_micros(59_999_500));

        let err = limiter.check_and_record("echo").unwrap_err();
        assert_eq!(err.retry_after(), Some(0.001));
    }

    #[test]
    fn test_retry_after_rounds_up_to_millis() {
        let (limiter, clock) = limiter(1, 60);
        limiter.check_and_record("echo").unwrap();
        clock.advance(Duration::from_micros(1_500));

        let retry_after = limiter.check_and_record("echo").unwrap_err().retry_after().unwrap();
        assert!((retry_after - 59.999).abs() < 1e-9, "retry_after = {}", retry_after);
    }

    #[test]
    fn test_idle_windows_are_evicted() {
        let (limiter, clock) = limiter(5, 60);
        for i in 0..10_000 {
            limiter.check_and_record(&format!("bogus.{}", i)).unwrap();
        }
        assert_eq!(limiter.tracked_tools(), 10_000);

        clock.advance(Duration::from_secs(3600));
        limiter.check_and_record("echo").unwrap();
        assert_eq!(limiter.tracked_tools(), 1);
    }

    #[test]
    fn test_sweep_keeps_active_windows() {
        let (limiter, clock) = limiter(5, 60);
        limiter.check_and_record("old").unwrap();
        clock.advance(Duration::from_secs(50));
        limiter.check_and_record("recent").unwrap();

        clock.advance(Duration::from_secs(20));
        limiter.check_and_record("new").unwrap();
        assert_eq!(limiter.tracked_tools(), 2);
        assert_eq!(limiter.stored_timestamps("recent"), 1);
        assert_eq!(limiter.stored_timestamps("old"), 0);
    }

    #[test]
    fn test_rejection_does_not_record() {
        let (limiter, _clock) = limiter(1, 60);
        limiter.check_and_record("echo").unwrap();
        assert!(limiter.check_and_record("echo").is_err());
        assert!(limiter.check_and_record("echo").is_err());
        assert_eq!(limiter.stored_timestamps("echo"), 1);
    }

    #[test]
    fn test_window_elapse_purges_and_admits() {
        let (limiter, clock) = limiter(3, 60);
        for _ in 0..3 {
            limiter.check_and_record("echo").unwrap();
        }
        assert!(limiter.check_and_record("echo").is_err());

        clock.advance(Duration::from_secs(61));
        limiter.check_and_record("echo").unwrap();
        assert_eq!(limiter.stored_timestamps("echo"), 1);
        assert_eq!(limiter.get_remaining("echo"), 2);
    }

    #[test]
    fn test_tools_have_independent_windows() {
        let (limiter, _clock) = limiter(1, 60);
        limiter.check_and_record("journal.search").unwrap();
        limiter.check_and_record("journal.log_meal").unwrap();
        assert!(limiter.check_and_record("journal.search").is_err());
    }

    #[test]
    fn test_per_tool_override() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = RateLimitConfig::uniform(RateLimitRule::per_minute(5))
            .with_override("profile.synthesize", RateLimitRule::per_minute(1));
        let limiter = RateLimiter::with_clock(config, clock);

        assert_eq!(limiter.limit_for("profile.synthesize").max_calls, 1);
        assert_eq!(limiter.limit_for("journal.search").max_calls, 5);
        limiter.check_and_record("profile.synthesize").unwrap();
        assert!(limiter.check_and_record("profile.synthesize").is_err());
    }

    #[test]
    fn test_default_overrides_are_tighter_for_ai_tools() {
        let config = RateLimitConfig::default();
        assert!(
            config.rule_for("profile.synthesize").max_calls
                < config.rule_for("journal.search").max_calls
        );
    }

    #[test]
    fn test_get_remaining() {
        let (limiter, _clock) = limiter(3, 60);
        assert_eq!(limiter.get_remaining("echo"), 3);
        limiter.check_and_record("echo").unwrap();
        assert_eq!(limiter.get_remaining("echo"), 2);
        for _ in 0..2 {
            limiter.check_and_record("echo").unwrap();
        }
        assert_eq!(limiter.get_remaining("echo"), 0);
        let _ = limiter.check_and_record("echo");
        assert_eq!(limiter.get_remaining("echo"), 0);
    }

    #[test]
    fn test_reset_one_and_all() {
        let (limiter, _clock) = limiter(1, 60);
        limiter.check_and_record("a").unwrap();
        limiter.check_and_record("b").unwrap();

        limiter.reset(Some("a"));
        assert!(limiter.check_and_record("a").is_ok());
        assert!(limiter.check_and_record("b").is_err());

        limiter.reset(None);
        assert!(limiter.check_and_record("b").is_ok());
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let (limiter, _clock) = limiter(10, 60);
        let limiter = Arc::new(limiter);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| limiter.check_and_record("echo").is_ok())
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
    }

    /// Clock that moves forward one millisecond on every read.
    #[derive(Debug)]
    struct TickingClock(ManualClock);

    impl Clock for TickingClock {
        fn now(&self) -> DateTime<Utc> {
            self.0.advance(Duration::from_millis(1));
            self.0.now()
        }
    }

    #[test]
    fn test_concurrent_timestamps_stay_ordered() {
        let clock = Arc::new(TickingClock(ManualClock::starting_now()));
        let limiter = Arc::new(RateLimiter::with_clock(
            RateLimitConfig::uniform(RateLimitRule::per_minute(10_000)),
            clock,
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        limiter.check_and_record("echo").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let table = limiter.lock();
        let timestamps = &table.windows["echo"].timestamps;
        assert_eq!(timestamps.len(), 1600);
        assert!(timestamps.iter().zip(timestamps.iter().skip(1)).all(|(a, b)| a <= b));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = RateLimitConfig::uniform(RateLimitRule::per_minute(1))
            .with_override("x", RateLimitRule::new(1, Duration::ZERO));
        assert!(config.validate().is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_never_admits_more_than_budget_per_window(
            max_calls in 1usize..8,
            gaps in proptest::collection::vec(0u64..40, 1..60),
        ) {
            let (limiter, clock) = limiter(max_calls, 60);
            let mut elapsed = 0u64;
            let mut admitted: Vec<u64> = Vec::new();

            for gap in gaps {
                clock.advance(Duration::from_secs(gap));
                elapsed += gap;
                if limiter.check_and_record("tool").is_ok() {
                    admitted.push(elapsed);
                }
                let in_window = admitted.iter().filter(|&&t| elapsed - t < 60).count();
                proptest::prop_assert!(in_window <= max_calls);
            }
        }
    }
}
