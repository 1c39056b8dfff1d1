//! Tool registry: descriptors, registration-time schema inference, short names.
//!
//! The registry is filled once during startup (`&mut self`) and then shared
//! read-only behind an `Arc`; lookups never lock.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use super::schema::{self, ParamDef};
use super::ToolHandler;
use crate::types::{Error, Result};

// =============================================================================
// Descriptor
// =============================================================================

/// Everything the control plane knows about one tool.
#[derive(Clone)]
pub struct ToolDescriptor {
    /// Dot-namespaced unique name, e.g. `journal.log_meal`.
    pub name: String,
    /// Last dot segment of `name`.
    pub short_name: String,
    pub description: String,
    pub category: String,
    pub requires_write: bool,
    pub requires_admin: bool,
    /// Parameters injected at call time; hidden from callers.
    pub dependency_names: BTreeSet<String>,
    /// Caller-facing JSON Schema, inferred once.
    pub input_schema: Value,
    /// Circuit breaker resource guarding the invocation, if any.
    pub protected_by: Option<String>,
    pub params: Vec<ParamDef>,
    pub handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("requires_write", &self.requires_write)
            .field("requires_admin", &self.requires_admin)
            .field("dependency_names", &self.dependency_names)
            .field("protected_by", &self.protected_by)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    pub fn builder(name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> ToolDescriptorBuilder {
        ToolDescriptorBuilder {
            name: name.into(),
            handler,
            description: String::new(),
            category: "general".to_string(),
            requires_write: false,
            requires_admin: false,
            extra_dependencies: BTreeSet::new(),
            protected_by: None,
        }
    }
}

/// Builder for [`ToolDescriptor`]. `build` infers the input schema.
pub struct ToolDescriptorBuilder {
    name: String,
    handler: Arc<dyn ToolHandler>,
    description: String,
    category: String,
    requires_write: bool,
    requires_admin: bool,
    extra_dependencies: BTreeSet<String>,
    protected_by: Option<String>,
}

impl fmt::Debug for ToolDescriptorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptorBuilder")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("protected_by", &self.protected_by)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptorBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn requires_write(mut self, requires_write: bool) -> Self {
        self.requires_write = requires_write;
        self
    }

    pub fn requires_admin(mut self, requires_admin: bool) -> Self {
        self.requires_admin = requires_admin;
        self
    }

    /// Hide a parameter from callers even if it has no `Depends` default.
    pub fn dependency(mut self, name: impl Into<String>) -> Self {
        self.extra_dependencies.insert(name.into());
        self
    }

    /// Guard invocations with the named circuit breaker.
    pub fn protected_by(mut self, resource: impl Into<String>) -> Self {
        self.protected_by = Some(resource.into());
        self
    }

    pub fn build(self) -> ToolDescriptor {
        let params = self.handler.parameters();
        let mut dependency_names = schema::dependency_names(&params);
        dependency_names.extend(self.extra_dependencies);
        let input_schema = schema::infer_schema(&params, &dependency_names);
        let short_name = short_name_of(&self.name).to_string();

        ToolDescriptor {
            name: self.name,
            short_name,
            description: self.description,
            category: self.category,
            requires_write: self.requires_write,
            requires_admin: self.requires_admin,
            dependency_names,
            input_schema,
            protected_by: self.protected_by,
            params,
            handler: self.handler,
        }
    }
}

fn short_name_of(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("Tool name cannot be empty"));
    }
    if name.split('.').any(|segment| segment.is_empty()) {
        return Err(Error::validation(format!(
            "Tool name '{}' has an empty segment",
            name
        )));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(Error::validation(format!(
            "Tool name '{}' contains whitespace",
            name
        )));
    }
    Ok(())
}

// =============================================================================
// Protocol listing
// =============================================================================

/// One entry of the client-facing tool list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolListing {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

// =============================================================================
// Registry
// =============================================================================

/// Name → descriptor map plus the short-name index.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDescriptor>>,
    short_names: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails without side effects on duplicates or bad names.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<()> {
        validate_name(&descriptor.name)?;
        if self.tools.contains_key(&descriptor.name) {
            return Err(Error::duplicate_tool(&descriptor.name));
        }

        if let Some(previous) = self.short_names.get(&descriptor.short_name) {
            tracing::warn!(
                short_name = %descriptor.short_name,
                previous = %previous,
                replacement = %descriptor.name,
                "short name collision, newest registration wins"
            );
        }
        self.short_names
            .insert(descriptor.short_name.clone(), descriptor.name.clone());

        tracing::info!(
            tool = %descriptor.name,
            category = %descriptor.category,
            dependencies = descriptor.dependency_names.len(),
            "tool registered"
        );
        self.tools
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Schema inference as used by registration.
    pub fn infer_schema(params: &[ParamDef], dependency_names: &BTreeSet<String>) -> Value {
        schema::infer_schema(params, dependency_names)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.get(name).cloned()
    }

    pub fn get_by_short_name(&self, short_name: &str) -> Option<Arc<ToolDescriptor>> {
        self.short_names
            .get(short_name)
            .and_then(|name| self.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Filtered snapshot, sorted by name. `None` filters match everything.
    pub fn list_tools(
        &self,
        category: Option<&str>,
        requires_write: Option<bool>,
        requires_admin: Option<bool>,
    ) -> Vec<Arc<ToolDescriptor>> {
        let mut tools: Vec<Arc<ToolDescriptor>> = self
            .tools
            .values()
            .filter(|t| category.map_or(true, |c| t.category == c))
            .filter(|t| requires_write.map_or(true, |w| t.requires_write == w))
            .filter(|t| requires_admin.map_or(true, |a| t.requires_admin == a))
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Client-facing `[{name, description, inputSchema}]`, sorted by name.
    pub fn to_protocol_list(&self) -> Vec<ToolListing> {
        self.list_tools(None, None, None)
            .into_iter()
            .map(|t| ToolListing {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Drop every registration. Teardown only.
    pub fn clear(&mut self) {
        self.tools.clear();
        self.short_names.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
