//! Per-call outcome and its wire envelope.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Outcome class of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    RateLimited,
    CircuitOpen,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::RateLimited => "rate_limited",
            ExecutionStatus::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one dispatched call. Never an `Err`; failures are data.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub status: ExecutionStatus,
    pub payload: Option<Value>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub retry_after: Option<f64>,
    pub duration_seconds: f64,
}

impl ToolExecutionResult {
    pub fn success(payload: Value) -> Self {
        Self {
            status: ExecutionStatus::Success,
            payload: Some(payload),
            error_message: None,
            error_code: None,
            retry_after: None,
            duration_seconds: 0.0,
        }
    }

    pub fn error(message: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            payload: None,
            error_message: Some(message.into()),
            error_code: code.map(str::to_string),
            retry_after: None,
            duration_seconds: 0.0,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: f64) -> Self {
        Self {
            status: ExecutionStatus::RateLimited,
            retry_after: Some(retry_after),
            ..Self::error(message, None)
        }
    }

    pub fn circuit_open(message: impl Into<String>, retry_after: f64) -> Self {
        Self {
            status: ExecutionStatus::CircuitOpen,
            retry_after: Some(retry_after),
            ..Self::error(message, None)
        }
    }

    pub fn with_duration(mut self, duration_seconds: f64) -> Self {
        self.duration_seconds = duration_seconds;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Caller-facing envelope. Always carries `status`.
    pub fn to_envelope(&self) -> Value {
        let mut envelope = Map::new();
        match self.status {
            ExecutionStatus::Success => match &self.payload {
                Some(Value::Object(fields)) => {
                    envelope.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    envelope.insert("result".to_string(), other.clone());
                }
            },
            ExecutionStatus::Error => {
                envelope.insert("message".to_string(), json!(self.message()));
                if let Some(code) = &self.error_code {
                    envelope.insert("code".to_string(), json!(code));
                }
            }
            ExecutionStatus::RateLimited | ExecutionStatus::CircuitOpen => {
                envelope.insert("message".to_string(), json!(self.message()));
                envelope.insert("retry_after".to_string(), json!(self.retry_after.unwrap_or(0.0)));
            }
        }
        // Status last so a payload field can never shadow it
        envelope.insert("status".to_string(), json!(self.status.as_str()));
        Value::Object(envelope)
    }

    fn message(&self) -> &str {
        self.error_message.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_success_object_is_flattened() {
        let result = ToolExecutionResult::success(json!({"echo": "hi"}));
        assert_eq!(result.to_envelope(), json!({"status": "success", "echo": "hi"}));
    }

    #[test]
    fn test_success_scalar_goes_under_result() {
        let result = ToolExecutionResult::success(json!([1, 2]));
        assert_eq!(result.to_envelope(), json!({"status": "success", "result": [1, 2]}));
    }

    #[test]
    fn test_payload_cannot_override_status() {
        let result = ToolExecutionResult::success(json!({"status": "error"}));
        assert_eq!(result.to_envelope()["status"], "success");
    }

    #[test]
    fn test_error_envelope() {
        let result = ToolExecutionResult::error("Unknown tool: nope", Some("unknown_tool"));
        assert_eq!(
            result.to_envelope(),
            json!({"status": "error", "message": "Unknown tool: nope", "code": "unknown_tool"})
        );
        let bare = ToolExecutionResult::error("boom", None);
        assert!(bare.to_envelope().get("code").is_none());
    }

    #[test]
    fn test_backpressure_envelopes() {
        let limited = ToolExecutionResult::rate_limited("slow down", 12.5);
        assert_eq!(
            limited.to_envelope(),
            json!({"status": "rate_limited", "message": "slow down", "retry_after": 12.5})
        );
        let open = ToolExecutionResult::circuit_open("inference unavailable", 30.0);
        assert_eq!(open.to_envelope()["status"], "circuit_open");
        assert_eq!(open.to_envelope()["retry_after"], 30.0);
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(serde_json::to_value(ExecutionStatus::RateLimited).unwrap(), json!("rate_limited"));
    }
}
