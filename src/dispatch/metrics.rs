//! In-memory execution metrics per tool.
//!
//! Keeps the last `window_size` outcomes of every tool and derives success
//! rate, latency and per-status counts from them on demand.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::record::{ExecutionRecord, ExecutionSink};
use super::result::ExecutionStatus;

const DEFAULT_WINDOW_SIZE: usize = 100;
const DEFAULT_MAX_TOOLS: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Outcome {
    status: ExecutionStatus,
    duration_seconds: f64,
}

/// Sliding window of outcomes for a single tool.
#[derive(Debug)]
struct ToolWindow {
    outcomes: VecDeque<Outcome>,
    window_size: usize,
    last_seen: u64,
}

impl ToolWindow {
    fn new(window_size: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(window_size),
            window_size,
            last_seen: 0,
        }
    }

    fn push(&mut self, outcome: Outcome) {
        if self.outcomes.len() >= self.window_size {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);
    }

    fn snapshot(&self, tool: &str) -> ToolSnapshot {
        let calls = self.outcomes.len();
        let mut by_status = BTreeMap::new();
        let mut total_seconds = 0.0;
        for outcome in &self.outcomes {
            *by_status.entry(outcome.status.as_str().to_string()).or_insert(0) += 1;
            total_seconds += outcome.duration_seconds;
        }
        let successes = by_status.get("success").copied().unwrap_or(0);
        let (success_rate, avg_latency_ms) = if calls == 0 {
            (0.0, 0.0)
        } else {
            (
                successes as f64 / calls as f64,
                total_seconds * 1000.0 / calls as f64,
            )
        };
        ToolSnapshot {
            tool: tool.to_string(),
            calls,
            success_rate,
            avg_latency_ms,
            by_status,
        }
    }
}

/// Metrics for one tool over its current window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSnapshot {
    pub tool: String,
    pub calls: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub by_status: BTreeMap<String, usize>,
}

/// Metrics across all tools.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_calls: usize,
    pub tools: Vec<ToolSnapshot>,
}

#[derive(Debug, Default)]
struct MetricsTable {
    windows: HashMap<String, ToolWindow>,
    sequence: u64,
}

/// Execution sink that aggregates outcomes per tool.
///
/// At most `max_tools` names are tracked; recording a new name past the cap
/// evicts the least recently recorded one.
#[derive(Debug)]
pub struct ToolMetrics {
    window_size: usize,
    max_tools: usize,
    table: Mutex<MetricsTable>,
}

impl Default for ToolMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl ToolMetrics {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            max_tools: DEFAULT_MAX_TOOLS,
            table: Mutex::new(MetricsTable::default()),
        }
    }

    pub fn with_max_tools(mut self, max_tools: usize) -> Self {
        self.max_tools = max_tools.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MetricsTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self, tool: &str) -> Option<ToolSnapshot> {
        self.lock().windows.get(tool).map(|w| w.snapshot(tool))
    }

    /// All tools with history, sorted by name.
    pub fn summary(&self) -> MetricsSummary {
        let table = self.lock();
        let mut tools: Vec<ToolSnapshot> = table
            .windows
            .iter()
            .map(|(name, window)| window.snapshot(name))
            .collect();
        tools.sort_by(|a, b| a.tool.cmp(&b.tool));
        MetricsSummary {
            total_calls: tools.iter().map(|t| t.calls).sum(),
            tools,
        }
    }

    pub fn reset(&self) {
        self.lock().windows.clear();
    }
}

impl ExecutionSink for ToolMetrics {
    fn record(&self, record: &ExecutionRecord) {
        let mut table = self.lock();
        table.sequence += 1;
        let sequence = table.sequence;

        if !table.windows.contains_key(&record.tool) && table.windows.len() >= self.max_tools {
            let oldest = table
                .windows
                .iter()
                .min_by_key(|(_, window)| window.last_seen)
                .map(|(name, _)| name.clone());
            if let Some(name) = oldest {
                table.windows.remove(&name);
                tracing::debug!(evicted = %name, "tool metrics at capacity");
            }
        }

        let window = table
            .windows
            .entry(record.tool.clone())
            .or_insert_with(|| ToolWindow::new(self.window_size));
        window.last_seen = sequence;
        window.push(Outcome {
            status: record.status,
            duration_seconds: record.duration_seconds,
        });
    }
}
