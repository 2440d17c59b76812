//! The profile-driven tool model: MCP tool descriptors generated from the
//! profile, argument validation, and action -> operation dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use openapi_mcp_index::{OperationIndex, OperationInfo, ParameterLocation};
use rmcp::model::Tool;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::errors::GatewayError;
use crate::profile::{ParamType, ParameterSpec, Profile, ToolSpec};

/// Strategy for naming synthesized tools when no profile is supplied.
/// External collaborators may plug in smarter shortening heuristics; the
/// registry only relies on the bounds.
pub trait ToolNamer: Send + Sync {
    fn name_for(&self, operation: &OperationInfo) -> String;
}

/// Deterministic default: sanitize the operationId into the MCP tool-name
/// alphabet and truncate at the configured bound. Stable across runs for the
/// same document.
pub struct DefaultToolNamer {
    pub max_length: usize,
    pub warn_length: usize,
}

impl Default for DefaultToolNamer {
    fn default() -> Self {
        Self {
            max_length: 64,
            warn_length: 55,
        }
    }
}

impl ToolNamer for DefaultToolNamer {
    fn name_for(&self, operation: &OperationInfo) -> String {
        let mut name: String = operation
            .operation_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if name.len() > self.warn_length {
            warn!(
                operation_id = %operation.operation_id,
                length = name.len(),
                "tool name approaching the length bound"
            );
        }
        if name.len() > self.max_length {
            name.truncate(self.max_length);
        }
        name
    }
}

/// One exposed tool: the profile spec plus its materialized MCP descriptor.
#[derive(Clone)]
pub struct GatewayTool {
    pub spec: ToolSpec,
    pub descriptor: Tool,
    /// Synthesized tools bypass action dispatch and always hit one operation.
    direct_operation: Option<String>,
}

impl GatewayTool {
    fn from_spec(spec: ToolSpec) -> Self {
        let descriptor = generate_descriptor(&spec);
        Self {
            spec,
            descriptor,
            direct_operation: None,
        }
    }

    /// Validate `args` against the parameter specs. Pure check: valid args
    /// pass through untouched.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<(), GatewayError> {
        let action = args.get("action").and_then(Value::as_str);

        for (name, spec) in &self.spec.parameters {
            let value = args.get(name).filter(|v| !v.is_null());

            let required_now = spec.required
                || action.is_some_and(|a| spec.required_for.iter().any(|r| r == a));
            let Some(value) = value else {
                if required_now {
                    return Err(GatewayError::validation(format!(
                        "missing required parameter {name:?} for tool {:?}",
                        self.spec.name
                    )));
                }
                continue;
            };

            if !spec.param_type.matches(value) {
                return Err(GatewayError::validation(format!(
                    "parameter {name:?} must be of type {}, got {value}",
                    spec.param_type.as_str()
                )));
            }

            if let Some(allowed) = &spec.enum_values {
                if !allowed.contains(value) {
                    return Err(GatewayError::validation(format!(
                        "parameter {name:?} must be one of {allowed:?}, got {value}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Pick the operation for these args: `{action}_{resource_type}` wins
    /// over the bare action. `None` means the profile declares no mapping;
    /// the caller turns that into a validation error rather than guessing.
    pub fn map_action_to_operation(&self, args: &Map<String, Value>) -> Option<String> {
        if let Some(direct) = &self.direct_operation {
            return Some(direct.clone());
        }
        let operations = self.spec.operations.as_ref()?;
        let action = args.get("action").and_then(Value::as_str)?;
        if let Some(resource) = args.get("resource_type").and_then(Value::as_str) {
            let compound = format!("{action}_{resource}");
            if let Some(id) = operations.get(&compound) {
                return Some(id.clone());
            }
        }
        operations.get(action).cloned()
    }

    /// Operation keys, for error messages.
    pub fn operation_keys(&self) -> Vec<String> {
        self.spec
            .operations
            .as_ref()
            .map(|ops| ops.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Materialized set of tools the gateway serves, either profile-driven or
/// synthesized from the whole OpenAPI document.
pub struct ToolRegistry {
    tools: Vec<GatewayTool>,
}

impl ToolRegistry {
    pub fn from_profile(profile: &Profile) -> Self {
        Self {
            tools: profile
                .tools
                .iter()
                .cloned()
                .map(GatewayTool::from_spec)
                .collect(),
        }
    }

    /// No profile: one tool per indexed operation, named by the pluggable
    /// strategy.
    pub fn synthesize(index: &OperationIndex, namer: &dyn ToolNamer) -> Self {
        let tools = index
            .all_operations()
            .into_iter()
            .map(|operation| {
                let name = namer.name_for(&operation);
                let spec = synthesize_spec(&name, &operation);
                let descriptor = generate_descriptor(&spec);
                GatewayTool {
                    spec,
                    descriptor,
                    direct_operation: Some(operation.operation_id.clone()),
                }
            })
            .collect();
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&GatewayTool> {
        self.tools.iter().find(|tool| tool.spec.name == name)
    }

    pub fn descriptors(&self) -> Vec<Tool> {
        self.tools.iter().map(|t| t.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Build the MCP `inputSchema` for a tool from its parameter specs.
fn generate_descriptor(spec: &ToolSpec) -> Tool {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for (name, param) in &spec.parameters {
        properties.insert(name.clone(), parameter_schema(param));
        if param.required {
            required.push(Value::String(name.clone()));
        }
    }

    let mut schema = Map::new();
    schema.insert("type".to_string(), json!("object"));
    schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".to_string(), Value::Array(required));
    }

    Tool::new(
        spec.name.clone(),
        spec.description.clone().unwrap_or_default(),
        Arc::new(schema),
    )
}

fn parameter_schema(param: &ParameterSpec) -> Value {
    let mut schema = Map::new();
    schema.insert("type".to_string(), json!(param.param_type.as_str()));
    let description = match (&param.description, param.required_for.as_slice()) {
        (Some(d), []) => Some(d.clone()),
        (Some(d), actions) => Some(format!("{d} (required for: {})", actions.join(", "))),
        (None, []) => None,
        (None, actions) => Some(format!("Required for: {}", actions.join(", "))),
    };
    if let Some(description) = description {
        schema.insert("description".to_string(), json!(description));
    }
    if let Some(values) = &param.enum_values {
        schema.insert("enum".to_string(), json!(values));
    }
    if let Some(items) = &param.items {
        schema.insert("items".to_string(), json!({ "type": items.item_type.as_str() }));
    }
    if let Some(default) = &param.default {
        schema.insert("default".to_string(), default.clone());
    }
    if let Some(example) = &param.example {
        schema.insert("examples".to_string(), json!([example]));
    }
    Value::Object(schema)
}

/// Parameter specs for a synthesized tool: every declared path/query
/// parameter, typed from its OpenAPI schema.
fn synthesize_spec(name: &str, operation: &OperationInfo) -> ToolSpec {
    let mut parameters = BTreeMap::new();
    for param in &operation.parameters {
        if !matches!(
            param.location,
            ParameterLocation::Path | ParameterLocation::Query
        ) {
            continue;
        }
        parameters.insert(
            param.name.clone(),
            ParameterSpec {
                param_type: openapi_type(&param.schema),
                description: param
                    .schema
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                required: param.required,
                required_for: Vec::new(),
                enum_values: param.schema.get("enum").and_then(Value::as_array).cloned(),
                items: None,
                default: param.schema.get("default").cloned(),
                example: None,
            },
        );
    }
    ToolSpec {
        name: name.to_string(),
        description: operation
            .summary
            .clone()
            .or_else(|| operation.description.clone())
            .or_else(|| {
                Some(format!(
                    "{} {}",
                    operation.method, operation.path
                ))
            }),
        parameters,
        operations: None,
        composite: false,
        steps: None,
        metadata_params: Vec::new(),
        response_fields: None,
        partial_results: false,
        parameter_aliases: Default::default(),
    }
}

fn openapi_type(schema: &Value) -> ParamType {
    match schema.get("type").and_then(Value::as_str) {
        Some("integer") => ParamType::Integer,
        Some("number") => ParamType::Number,
        Some("boolean") => ParamType::Boolean,
        Some("array") => ParamType::Array,
        Some("object") => ParamType::Object,
        _ => ParamType::String,
    }
}
