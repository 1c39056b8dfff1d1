//! Configuration structures.
//!
//! Configuration is loaded from an optional JSON file, then overridden from
//! `PLATEWISE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::{Error, Result};
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::rate_limiter::RateLimitConfig;

/// Global control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Per-tool admission budgets.
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Per-upstream circuit breaker settings.
    #[serde(default)]
    pub circuit_breakers: CircuitBreakerConfig,

    /// Production capability construction.
    #[serde(default)]
    pub capabilities: CapabilityConfig,

    /// Dispatcher settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Load from `path` (JSON) when given, else defaults; then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str::<Config>(&raw)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `PLATEWISE_*` overrides using the given variable lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("PLATEWISE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("PLATEWISE_LOG_FORMAT") {
            self.observability.json_logs = format.eq_ignore_ascii_case("json");
        }
        if let Some(url) = lookup("PLATEWISE_INFERENCE_URL") {
            self.capabilities.inference_url = url;
        }
        if let Some(model) = lookup("PLATEWISE_INFERENCE_MODEL") {
            self.capabilities.inference_model = model;
        }
        if let Some(user) = lookup("PLATEWISE_DEFAULT_USER") {
            self.dispatch.default_user_id = user;
        }
    }

    /// Reject settings that would make admission or breaking meaningless.
    pub fn validate(&self) -> Result<()> {
        self.rate_limits.validate()?;
        self.circuit_breakers.validate()?;
        if self.dispatch.max_logged_argument_chars == 0 {
            return Err(Error::config("dispatch.max_logged_argument_chars must be > 0"));
        }
        if self.dispatch.default_user_id.trim().is_empty() {
            return Err(Error::config("dispatch.default_user_id cannot be empty"));
        }
        if self.dispatch.max_request_bytes == 0 {
            return Err(Error::config("dispatch.max_request_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Settings for the production capability implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Chat-completions endpoint used by the inference client.
    pub inference_url: String,

    /// Model name sent with every completion request.
    pub inference_model: String,

    /// Environment variable holding the inference API key.
    pub inference_api_key_env: String,

    /// Timeout for every outbound request.
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,

    /// User-Agent header for outbound requests.
    pub user_agent: String,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            inference_url: "https://api.openai.com/v1/chat/completions".to_string(),
            inference_model: "gpt-4o-mini".to_string(),
            inference_api_key_env: "PLATEWISE_INFERENCE_API_KEY".to_string(),
            http_timeout: Duration::from_secs(30),
            user_agent: concat!("platewise/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Serialized arguments longer than this are truncated in call records.
    pub max_logged_argument_chars: usize,

    /// Caller identity used when the transport supplies none.
    pub default_user_id: String,

    /// Whether stdio callers may invoke write tools.
    pub can_write: bool,

    /// Whether stdio callers may invoke admin tools.
    pub is_admin: bool,

    /// Longest request line the stdio server accepts, in bytes.
    pub max_request_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_logged_argument_chars: 200,
            default_user_id: "local".to_string(),
            can_write: true,
            is_admin: false,
            max_request_bytes: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.max_logged_argument_chars, 200);
    }

    #[test]
    fn test_load_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "rate_limits": {{
                    "default": {{"max_calls": 5, "window": "30s"}},
                    "overrides": {{"journal.search": {{"max_calls": 2, "window": "1m"}}}}
                }},
                "dispatch": {{"max_logged_argument_chars": 64}}
            }}"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.rate_limits.default.max_calls, 5);
        assert_eq!(config.rate_limits.default.window, Duration::from_secs(30));
        let search = &config.rate_limits.overrides["journal.search"];
        assert_eq!(search.max_calls, 2);
        assert_eq!(search.window, Duration::from_secs(60));
        assert_eq!(config.dispatch.max_logged_argument_chars, 64);
        // Untouched sections keep their defaults
        assert_eq!(config.dispatch.default_user_id, "local");
        assert!(config.dispatch.can_write);
        assert!(!config.dispatch.is_admin);
    }

    #[test]
    fn test_load_rejects_zero_limit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"rate_limits": {{"default": {{"max_calls": 0, "window": "1m"}}}}}}"#
        )
        .unwrap();

        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_zero_request_size() {
        let mut config = Config::default();
        config.dispatch.max_request_bytes = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PLATEWISE_LOG_FORMAT", "JSON"),
            ("PLATEWISE_INFERENCE_MODEL", "local-llm"),
            ("PLATEWISE_DEFAULT_USER", "alice"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert!(config.observability.json_logs);
        assert_eq!(config.capabilities.inference_model, "local-llm");
        assert_eq!(config.dispatch.default_user_id, "alice");
        assert_eq!(config.observability.log_level, "info");
    }
}
