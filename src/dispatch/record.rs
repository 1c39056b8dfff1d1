//! Per-call observability records and the sinks that receive them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::result::ExecutionStatus;

/// One record per dispatched call, emitted whatever the outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub tool: String,
    pub call_id: Uuid,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub status: ExecutionStatus,
    /// Serialized arguments, truncated.
    pub arguments: String,
    pub error: Option<String>,
}

/// Receives execution records. Must not fail or panic.
pub trait ExecutionSink: Send + Sync + fmt::Debug {
    fn record(&self, record: &ExecutionRecord);
}

/// Default sink: one structured tracing event per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ExecutionSink for TracingSink {
    fn record(&self, record: &ExecutionRecord) {
        let duration_ms = record.duration_seconds * 1000.0;
        match record.status {
            ExecutionStatus::Success => tracing::info!(
                tool = %record.tool,
                call_id = %record.call_id,
                user = %record.user_id,
                status = %record.status,
                duration_ms,
                arguments = %record.arguments,
                "tool call completed"
            ),
            _ => tracing::warn!(
                tool = %record.tool,
                call_id = %record.call_id,
                user = %record.user_id,
                status = %record.status,
                duration_ms,
                arguments = %record.arguments,
                error = record.error.as_deref().unwrap_or(""),
                "tool call did not succeed"
            ),
        }
    }
}

/// Forwards every record to each inner sink in order.
#[derive(Debug, Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ExecutionSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ExecutionSink>>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: Arc<dyn ExecutionSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ExecutionSink for FanoutSink {
    fn record(&self, record: &ExecutionRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}

/// Serialize arguments for logging, cut to `max_chars` characters.
pub fn truncate_arguments(args: &Map<String, Value>, max_chars: usize) -> String {
    let serialized = Value::Object(args.clone()).to_string();
    truncate_chars(&serialized, max_chars)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + 3);
            out.push_str(&text[..cut]);
            out.push('…');
            out
        }
    }
}
