//! Meal log tools backed by the journal store.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::deps::{store_provider, Depends, JournalEntry};
use crate::tools::{
    int_arg, opt_int_arg, str_arg, str_list_arg, ParamDef, ParamType, ToolContext, ToolError,
    ToolHandler,
};

pub(crate) const STORE: &str = "store";
const MAX_LIMIT: i64 = 100;

fn store_param() -> ParamDef {
    ParamDef::depends(STORE, Depends(store_provider))
}

/// Read a `limit` argument, rejecting values outside 1..=100.
fn limit_arg(args: &Map<String, Value>) -> Result<usize, ToolError> {
    let limit = int_arg(args, "limit")?;
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ToolError::invalid(format!(
            "limit must be between 1 and {}, got {}",
            MAX_LIMIT, limit
        )));
    }
    Ok(limit as usize)
}

// =============================================================================
// journal.log_meal
// =============================================================================

#[derive(Debug, Default)]
pub struct LogMeal;

#[async_trait]
impl ToolHandler for LogMeal {
    fn parameters(&self) -> Vec<ParamDef> {
        vec![
            ParamDef::new("user_id", ParamType::String),
            ParamDef::new("description", ParamType::String).describe("What was eaten"),
            ParamDef::new("calories", ParamType::optional(ParamType::Integer))
                .describe("Calories, if known"),
            ParamDef::new("tags", ParamType::array_of(ParamType::String))
                .describe("Free-form labels such as breakfast or vegetarian")
                .with_default(json!([])),
            store_param(),
        ]
    }

    async fn call(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<Value, ToolError> {
        let description = str_arg(&args, "description")?;
        if description.trim().is_empty() {
            return Err(ToolError::invalid("description cannot be empty"));
        }
        let calories = opt_int_arg(&args, "calories");
        if matches!(calories, Some(c) if c < 0) {
            return Err(ToolError::invalid("calories cannot be negative"));
        }

        let entry = JournalEntry {
            id: Uuid::new_v4().to_string(),
            user_id: ctx.user_id().to_string(),
            logged_at: Utc::now(),
            description: description.trim().to_string(),
            calories,
            tags: str_list_arg(&args, "tags"),
        };
        let stored = ctx.store(STORE)?.insert(entry).await?;
        Ok(json!({ "meal": stored }))
    }
}

// =============================================================================
// journal.list_meals
// =============================================================================

#[derive(Debug, Default)]
pub struct ListMeals;

#[async_trait]
impl ToolHandler for ListMeals {
    fn parameters(&self) -> Vec<ParamDef> {
        vec![
            ParamDef::new("limit", ParamType::Integer)
                .describe("Maximum number of meals")
                .with_default(json!(20)),
            store_param(),
        ]
    }

    async fn call(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<Value, ToolError> {
        let limit = limit_arg(&args)?;
        let meals = ctx.store(STORE)?.list(ctx.user_id(), limit).await?;
        Ok(json!({ "count": meals.len(), "meals": meals }))
    }
}

// =============================================================================
// journal.delete_meal
// =============================================================================

#[derive(Debug, Default)]
pub struct DeleteMeal;

#[async_trait]
impl ToolHandler for DeleteMeal {
    fn parameters(&self) -> Vec<ParamDef> {
        vec![
            ParamDef::new("meal_id", ParamType::String).describe("Id returned by log_meal"),
            store_param(),
        ]
    }

    async fn call(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<Value, ToolError> {
        let meal_id = str_arg(&args, "meal_id")?;
        if !ctx.store(STORE)?.delete(ctx.user_id(), &meal_id).await? {
            return Err(ToolError::not_found(format!("No meal with id {}", meal_id)));
        }
        Ok(json!({ "deleted": meal_id }))
    }
}

// =============================================================================
// journal.search
// =============================================================================

#[derive(Debug, Default)]
pub struct SearchMeals;

#[async_trait]
impl ToolHandler for SearchMeals {
    fn parameters(&self) -> Vec<ParamDef> {
        vec![
            ParamDef::new("query", ParamType::String).describe("Text to look for"),
            ParamDef::new("limit", ParamType::Integer).with_default(json!(10)),
            store_param(),
        ]
    }

    async fn call(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<Value, ToolError> {
        let query = str_arg(&args, "query")?;
        if query.trim().is_empty() {
            return Err(ToolError::invalid("query cannot be empty"));
        }
        let limit = limit_arg(&args)?;
        let meals = ctx
            .store(STORE)?
            .search(ctx.user_id(), query.trim(), limit)
            .await?;
        Ok(json!({ "query": query, "count": meals.len(), "meals": meals }))
    }
}
