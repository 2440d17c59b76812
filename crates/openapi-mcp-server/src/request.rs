//! Builds upstream requests from a resolved operation plus validated tool
//! arguments: path template filling (alias-aware), query extraction with
//! arrays left intact, and metadata-aware body collection.

use std::collections::HashSet;

use http::header::ACCEPT;
use openapi_mcp_index::{OperationInfo, ParameterLocation};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::{Map, Value};
use url::Url;

use crate::errors::GatewayError;
use crate::profile::ToolSpec;
use crate::upstream::RequestContext;

/// Everything except unreserved characters is escaped, so path values like
/// `org/proj` arrive as a single `org%2Fproj` segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub struct RequestBuilder {
    base_url: Url,
}

impl RequestBuilder {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Assemble the request for `operation` from `args`. Arguments consumed
    /// by the path or declared as query parameters never leak into the body;
    /// metadata parameters never leave the gateway at all.
    pub fn build(
        &self,
        operation: &OperationInfo,
        tool: &ToolSpec,
        args: &Map<String, Value>,
    ) -> Result<RequestContext, GatewayError> {
        let mut consumed: HashSet<String> = HashSet::new();

        let path = self.fill_path(&operation.path, tool, args, &mut consumed)?;
        let mut url = self.base_url.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}{path}"));

        let mut ctx = RequestContext::new(operation.method.clone(), url);
        ctx.operation_id = Some(operation.operation_id.clone());
        ctx.headers
            .insert(ACCEPT, http::HeaderValue::from_static("application/json"));

        for param in operation.parameters_in(ParameterLocation::Query) {
            if let Some(value) = args.get(&param.name).filter(|v| !v.is_null()) {
                ctx.query.push((param.name.clone(), value.clone()));
                consumed.insert(param.name.clone());
            }
        }

        let body = self.collect_body(operation, tool, args, &consumed)?;
        ctx.body = body;
        Ok(ctx)
    }

    /// Fill every `{name}` placeholder, trying the canonical argument first
    /// and then each configured alias in order.
    fn fill_path(
        &self,
        template: &str,
        tool: &ToolSpec,
        args: &Map<String, Value>,
        consumed: &mut HashSet<String>,
    ) -> Result<String, GatewayError> {
        let mut filled = String::with_capacity(template.len());
        let mut rest = template;
        while let Some((head, tail)) = rest.split_once('{') {
            filled.push_str(head);
            let Some((name, after)) = tail.split_once('}') else {
                // Unbalanced brace; emit the remainder verbatim.
                filled.push('{');
                filled.push_str(tail);
                return Ok(filled);
            };
            let value = self.lookup_path_value(name, tool, args, consumed)?;
            filled.push_str(&utf8_percent_encode(&value, PATH_SEGMENT).to_string());
            rest = after;
        }
        filled.push_str(rest);
        Ok(filled)
    }

    fn lookup_path_value(
        &self,
        name: &str,
        tool: &ToolSpec,
        args: &Map<String, Value>,
        consumed: &mut HashSet<String>,
    ) -> Result<String, GatewayError> {
        let mut candidates = vec![name.to_string()];
        if let Some(aliases) = tool.parameter_aliases.get(name) {
            candidates.extend(aliases.iter().cloned());
        }
        for candidate in &candidates {
            if let Some(value) = args.get(candidate).filter(|v| !v.is_null()) {
                consumed.insert(candidate.clone());
                return Ok(path_value(value));
            }
        }
        Err(GatewayError::validation(format!(
            "missing path parameter {name:?} (tried: {})",
            candidates.join(", ")
        )))
    }

    /// Everything not consumed and not metadata becomes the body. Declared
    /// request bodies are validated against their schema before leaving.
    fn collect_body(
        &self,
        operation: &OperationInfo,
        tool: &ToolSpec,
        args: &Map<String, Value>,
        consumed: &HashSet<String>,
    ) -> Result<Option<Value>, GatewayError> {
        let path_param_names: HashSet<&str> = operation
            .parameters_in(ParameterLocation::Path)
            .map(|p| p.name.as_str())
            .collect();
        let query_param_names: HashSet<&str> = operation
            .parameters_in(ParameterLocation::Query)
            .map(|p| p.name.as_str())
            .collect();

        let mut body = Map::new();
        for (key, value) in args {
            if consumed.contains(key)
                || tool.metadata_params.iter().any(|m| m == key)
                || path_param_names.contains(key.as_str())
                || query_param_names.contains(key.as_str())
                || value.is_null()
            {
                continue;
            }
            body.insert(key.clone(), value.clone());
        }

        if body.is_empty() {
            return Ok(None);
        }
        let body = Value::Object(body);

        if let Some(schema) = operation
            .request_body
            .as_ref()
            .and_then(|rb| rb.schema.as_ref())
        {
            validate_body(schema, &body)?;
        }
        Ok(Some(body))
    }
}

fn path_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON-schema validation of the collected body; failures become validation
/// errors carrying the offending field paths.
fn validate_body(schema: &Value, body: &Value) -> Result<(), GatewayError> {
    let validator = jsonschema::validator_for(schema).map_err(|e| {
        GatewayError::configuration(format!("operation declares an invalid body schema: {e}"))
    })?;
    let failures: Vec<String> = validator
        .iter_errors(body)
        .map(|error| format!("{}: {}", error.instance_path, error))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::validation_with_detail(
            "request body failed schema validation",
            Value::Array(failures.into_iter().map(Value::String).collect()),
        ))
    }
}

/// Project a response onto the per-action field allow-list, when declared.
/// Objects keep only the listed top-level keys; arrays are projected
/// element-wise.
pub fn filter_response_fields(tool: &ToolSpec, action: Option<&str>, body: Value) -> Value {
    let Some(fields) = action.and_then(|a| {
        tool.response_fields
            .as_ref()
            .and_then(|by_action| by_action.get(a))
    }) else {
        return body;
    };
    project(body, fields)
}

fn project(body: Value, fields: &[String]) -> Value {
    match body {
        Value::Object(obj) => Value::Object(
            obj.into_iter()
                .filter(|(k, _)| fields.iter().any(|f| f == k))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| project(item, fields))
                .collect(),
        ),
        other => other,
    }
}
