//! Built-in food journal tools.
//!
//! Registration is explicit: `main` (or a test) calls
//! [`register_builtin_tools`] on a fresh registry before building the
//! dispatcher.

mod insights;
mod meals;

pub use insights::{CircuitStatusReport, EstimateNutrition, SynthesizeProfile};
pub use meals::{DeleteMeal, ListMeals, LogMeal, SearchMeals};

use std::sync::Arc;

use crate::resilience::CircuitBreakerRegistry;
use crate::tools::{ToolDescriptor, ToolRegistry};
use crate::types::Result;

/// Breaker resource guarding inference-backed tools.
pub const INFERENCE_RESOURCE: &str = "inference";

/// Register every built-in tool. Fails on the first duplicate.
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    breakers: Arc<CircuitBreakerRegistry>,
) -> Result<()> {
    let tools = [
        ToolDescriptor::builder("journal.log_meal", Arc::new(LogMeal))
            .description("Log a meal to the caller's food journal")
            .category("journal")
            .requires_write(true)
            .build(),
        ToolDescriptor::builder("journal.list_meals", Arc::new(ListMeals))
            .description("List the caller's most recent meals")
            .category("journal")
            .build(),
        ToolDescriptor::builder("journal.delete_meal", Arc::new(DeleteMeal))
            .description("Delete one meal from the caller's journal")
            .category("journal")
            .requires_write(true)
            .build(),
        ToolDescriptor::builder("journal.search", Arc::new(SearchMeals))
            .description("Search the caller's meals by description or tag")
            .category("journal")
            .build(),
        ToolDescriptor::builder("nutrition.estimate", Arc::new(EstimateNutrition))
            .description("Estimate the calories of a described meal")
            .category("nutrition")
            .protected_by(INFERENCE_RESOURCE)
            .build(),
        ToolDescriptor::builder("profile.synthesize", Arc::new(SynthesizeProfile))
            .description("Summarize the caller's eating habits from their journal")
            .category("profile")
            .protected_by(INFERENCE_RESOURCE)
            .build(),
        ToolDescriptor::builder("admin.circuit_status", Arc::new(CircuitStatusReport::new(breakers)))
            .description("Report the state of every circuit breaker")
            .category("admin")
            .requires_admin(true)
            .build(),
    ];

    for tool in tools {
        registry.register(tool)?;
    }
    Ok(())
}
