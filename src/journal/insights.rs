//! Inference-backed tools and the admin breaker view.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::meals::STORE;
use crate::deps::{inference_provider, store_provider, CompletionRequest, Depends};
use crate::resilience::CircuitBreakerRegistry;
use crate::tools::{str_arg, ParamDef, ParamType, ToolContext, ToolError, ToolHandler};

const INFERENCE: &str = "inference";
const PROFILE_SAMPLE: usize = 50;

const ESTIMATE_SYSTEM: &str =
    "You estimate the calories of a meal. Reply with a single integer number of kcal.";
const PROFILE_SYSTEM: &str =
    "You summarize eating habits from a meal log in three short sentences.";

/// First run of ASCII digits in `text`, as an integer.
fn first_integer(text: &str) -> Option<i64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

// =============================================================================
// nutrition.estimate
// =============================================================================

#[derive(Debug, Default)]
pub struct EstimateNutrition;

#[async_trait]
impl ToolHandler for EstimateNutrition {
    fn parameters(&self) -> Vec<ParamDef> {
        vec![
            ParamDef::new("description", ParamType::String).describe("Meal to estimate"),
            ParamDef::depends(INFERENCE, Depends(inference_provider)),
        ]
    }

    async fn call(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<Value, ToolError> {
        let description = str_arg(&args, "description")?;
        if description.trim().is_empty() {
            return Err(ToolError::invalid("description cannot be empty"));
        }

        let request = CompletionRequest {
            max_tokens: Some(16),
            temperature: Some(0.0),
            ..CompletionRequest::new(description.trim()).with_system(ESTIMATE_SYSTEM)
        };
        let reply = ctx.inference(INFERENCE)?.complete(request).await?;

        Ok(json!({
            "description": description,
            "estimated_calories": first_integer(&reply),
            "raw": reply.trim(),
        }))
    }
}

// =============================================================================
// profile.synthesize
// =============================================================================

#[derive(Debug, Default)]
pub struct SynthesizeProfile;

#[async_trait]
impl ToolHandler for SynthesizeProfile {
    fn parameters(&self) -> Vec<ParamDef> {
        vec![
            ParamDef::new("user_id", ParamType::String),
            ParamDef::depends(STORE, Depends(store_provider)),
            ParamDef::depends(INFERENCE, Depends(inference_provider)),
        ]
    }

    async fn call(&self, ctx: ToolContext, _args: Map<String, Value>) -> Result<Value, ToolError> {
        let meals = ctx.store(STORE)?.list(ctx.user_id(), PROFILE_SAMPLE).await?;
        if meals.is_empty() {
            return Err(ToolError::not_found("No meals logged yet"));
        }

        let log: Vec<String> = meals
            .iter()
            .map(|m| match m.calories {
                Some(kcal) => format!("- {} ({} kcal)", m.description, kcal),
                None => format!("- {}", m.description),
            })
            .collect();
        let request = CompletionRequest::new(log.join("\n")).with_system(PROFILE_SYSTEM);
        let profile = ctx.inference(INFERENCE)?.complete(request).await?;

        Ok(json!({
            "meal_count": meals.len(),
            "profile": profile.trim(),
        }))
    }
}

// =============================================================================
// admin.circuit_status
// =============================================================================

#[derive(Debug)]
pub struct CircuitStatusReport {
    breakers: Arc<CircuitBreakerRegistry>,
}

impl CircuitStatusReport {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { breakers }
    }
}

#[async_trait]
impl ToolHandler for CircuitStatusReport {
    fn parameters(&self) -> Vec<ParamDef> {
        Vec::new()
    }

    async fn call(&self, _ctx: ToolContext, _args: Map<String, Value>) -> Result<Value, ToolError> {
        let circuits = serde_json::to_value(self.breakers.statuses())
            .map_err(|err| ToolError::failed(err.to_string()))?;
        Ok(json!({ "circuits": circuits }))
    }
}
