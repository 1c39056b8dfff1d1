//! Declared tool parameters, JSON Schema inference and argument validation.
//!
//! A handler declares its signature as a list of [`ParamDef`]s. Inference
//! walks that list once at registration time; nothing here runs per call
//! except [`validate_arguments`] and [`fill_defaults`].

use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::fmt;

use crate::deps::Depends;

/// Parameter name the dispatcher always supplies from the caller identity.
pub const USER_ID_PARAM: &str = "user_id";

// =============================================================================
// Parameter types
// =============================================================================

/// Declared type of a handler parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    /// Sequence of the inner type.
    Array(Box<ParamType>),
    /// String-keyed mapping.
    Object,
    /// May be omitted or null.
    Optional(Box<ParamType>),
    /// A type the schema mapper does not understand; carries its name.
    Unknown(String),
}

impl ParamType {
    pub fn array_of(item: ParamType) -> Self {
        ParamType::Array(Box::new(item))
    }

    pub fn optional(inner: ParamType) -> Self {
        ParamType::Optional(Box::new(inner))
    }

    pub fn unknown(type_name: impl Into<String>) -> Self {
        ParamType::Unknown(type_name.into())
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, ParamType::Optional(_))
    }

    /// JSON Schema fragment for this type. Unknown types map to `string`.
    pub fn to_schema(&self) -> Value {
        match self {
            ParamType::String | ParamType::Unknown(_) => json!({"type": "string"}),
            ParamType::Integer => json!({"type": "integer"}),
            ParamType::Number => json!({"type": "number"}),
            ParamType::Boolean => json!({"type": "boolean"}),
            ParamType::Array(item) => json!({"type": "array", "items": item.to_schema()}),
            ParamType::Object => json!({"type": "object"}),
            ParamType::Optional(inner) => inner.to_schema(),
        }
    }

    /// Validate a JSON value against this parameter type.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        match self {
            ParamType::String | ParamType::Unknown(_) => expect(value.is_string(), "string", value),
            ParamType::Integer => expect(value.is_i64() || value.is_u64(), "integer", value),
            ParamType::Number => expect(value.is_number(), "number", value),
            ParamType::Boolean => expect(value.is_boolean(), "boolean", value),
            ParamType::Object => expect(value.is_object(), "object", value),
            ParamType::Array(item) => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| format!("expected array, got {}", value_type_name(value)))?;
                for (i, element) in arr.iter().enumerate() {
                    item.validate(element)
                        .map_err(|e| format!("at index {}: {}", i, e))?;
                }
                Ok(())
            }
            ParamType::Optional(inner) => {
                if value.is_null() {
                    Ok(())
                } else {
                    inner.validate(value)
                }
            }
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::String => f.write_str("string"),
            ParamType::Integer => f.write_str("integer"),
            ParamType::Number => f.write_str("number"),
            ParamType::Boolean => f.write_str("boolean"),
            ParamType::Array(item) => write!(f, "{}[]", item),
            ParamType::Object => f.write_str("object"),
            ParamType::Optional(inner) => write!(f, "{}?", inner),
            ParamType::Unknown(name) => f.write_str(name),
        }
    }
}

fn expect(ok: bool, expected: &str, value: &Value) -> Result<(), String> {
    if ok {
        Ok(())
    } else {
        Err(format!("expected {}, got {}", expected, value_type_name(value)))
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Parameter definition
// =============================================================================

/// Default of a declared parameter.
#[derive(Debug, Clone)]
pub enum ParamDefault {
    /// Caller must supply it (unless the type is optional).
    None,
    /// Literal default filled in when the caller omits it.
    Value(Value),
    /// Injected from the dependency container; never caller-facing.
    Depends(Depends),
}

/// A single declared handler parameter.
#[derive(Debug, Clone)]
pub struct ParamDef {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub default: ParamDefault,
}

impl ParamDef {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: String::new(),
            default: ParamDefault::None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = ParamDefault::Value(default);
        self
    }

    /// Parameter injected via `provider`. Its declared type is irrelevant.
    pub fn depends(name: impl Into<String>, provider: Depends) -> Self {
        Self {
            name: name.into(),
            param_type: ParamType::Object,
            description: String::new(),
            default: ParamDefault::Depends(provider),
        }
    }

    pub fn is_dependency(&self) -> bool {
        matches!(self.default, ParamDefault::Depends(_))
    }

    pub fn is_required(&self) -> bool {
        matches!(self.default, ParamDefault::None) && !self.param_type.is_optional()
    }

    fn is_caller_facing(&self, dependency_names: &BTreeSet<String>) -> bool {
        self.name != USER_ID_PARAM && !self.is_dependency() && !dependency_names.contains(&self.name)
    }
}

// =============================================================================
// Inference and validation
// =============================================================================

/// Names of all parameters injected through `Depends`.
pub fn dependency_names(params: &[ParamDef]) -> BTreeSet<String> {
    params
        .iter()
        .filter(|p| p.is_dependency())
        .map(|p| p.name.clone())
        .collect()
}

/// Build the caller-facing JSON Schema from a declared parameter list.
///
/// Skips `user_id`, injected parameters and anything in `dependency_names`.
/// Never fails: types it cannot map become `string` and are logged.
pub fn infer_schema(params: &[ParamDef], dependency_names: &BTreeSet<String>) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for param in params.iter().filter(|p| p.is_caller_facing(dependency_names)) {
        warn_on_unknown(&param.name, &param.param_type);

        let mut schema = param.param_type.to_schema();
        if let Some(obj) = schema.as_object_mut() {
            if !param.description.is_empty() {
                obj.insert("description".to_string(), json!(param.description));
            }
            if let ParamDefault::Value(default) = &param.default {
                obj.insert("default".to_string(), default.clone());
            }
        }
        properties.insert(param.name.clone(), schema);

        if param.is_required() {
            required.push(Value::String(param.name.clone()));
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn warn_on_unknown(param_name: &str, param_type: &ParamType) {
    match param_type {
        ParamType::Unknown(type_name) => tracing::warn!(
            param = param_name,
            type_name = %type_name,
            "unmapped parameter type, falling back to string schema"
        ),
        ParamType::Array(inner) | ParamType::Optional(inner) => warn_on_unknown(param_name, inner),
        _ => {}
    }
}

/// Check caller arguments against the declared parameters.
///
/// Returns every problem found (empty = valid).
pub fn validate_arguments(
    params: &[ParamDef],
    dependency_names: &BTreeSet<String>,
    args: &Map<String, Value>,
) -> Vec<String> {
    let facing: Vec<&ParamDef> = params
        .iter()
        .filter(|p| p.is_caller_facing(dependency_names))
        .collect();

    let mut errors = Vec::new();
    for param in &facing {
        if param.is_required() && !args.contains_key(&param.name) {
            errors.push(format!("Missing required parameter: {}", param.name));
        }
    }

    for (key, value) in args {
        match facing.iter().find(|p| p.name == *key) {
            Some(param) => {
                if let Err(e) = param.param_type.validate(value) {
                    errors.push(format!("Parameter '{}': {}", key, e));
                }
            }
            None => errors.push(format!("Unknown parameter: {}", key)),
        }
    }

    errors
}

/// Insert literal defaults for omitted parameters.
pub fn fill_defaults(params: &[ParamDef], args: &mut Map<String, Value>) {
    for param in params {
        if let ParamDefault::Value(default) = &param.default {
            if !args.contains_key(&param.name) {
                args.insert(param.name.clone(), default.clone());
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
