use std::collections::HashMap;
use std::path::Path;

use http::Method;
use serde_json::Value;

use crate::operation::{
    OperationInfo, ParameterInfo, ParameterLocation, RequestBodyInfo, SecurityScheme,
};
use crate::resolver::Resolver;
use crate::IndexError;

const METHODS: &[&str] = &["get", "put", "post", "delete", "options", "head", "patch", "trace"];

/// An index over every operation of an OpenAPI 3.0 document.
///
/// Built once at startup; lookups return owned clones so callers can mutate
/// the views without affecting the index.
pub struct OperationIndex {
    by_id: HashMap<String, OperationInfo>,
    by_path: HashMap<String, HashMap<Method, String>>,
    security: Option<SecurityScheme>,
    base_url: Option<String>,
}

impl OperationIndex {
    /// Load and index a JSON OpenAPI document from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| IndexError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let document: Value = serde_json::from_str(&raw)?;
        Self::from_document(&document)
    }

    /// Index an already-parsed document.
    pub fn from_document(document: &Value) -> Result<Self, IndexError> {
        let version = document.get("openapi").and_then(Value::as_str);
        match version {
            Some(v) if v.starts_with('3') => {}
            other => {
                return Err(IndexError::UnsupportedVersion(
                    other.map(|s| s.to_string()),
                ));
            }
        }

        let paths = document
            .get("paths")
            .and_then(Value::as_object)
            .ok_or(IndexError::MissingPaths)?;

        let resolver = Resolver::new(document);
        let mut by_id = HashMap::new();
        let mut by_path: HashMap<String, HashMap<Method, String>> = HashMap::new();

        for (path_template, item) in paths {
            let Some(item) = item.as_object() else {
                continue;
            };
            let shared_params = item
                .get("parameters")
                .map(|params| resolver.resolve(params))
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();

            for method_name in METHODS {
                let Some(op) = item.get(*method_name).and_then(Value::as_object) else {
                    continue;
                };
                let Ok(method) = method_name.to_uppercase().parse::<Method>() else {
                    continue;
                };
                let operation_id = op
                    .get("operationId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| synthesize_operation_id(method_name, path_template));

                let info = build_operation(
                    &resolver,
                    operation_id.clone(),
                    method.clone(),
                    path_template,
                    op,
                    &shared_params,
                );

                by_path
                    .entry(path_template.clone())
                    .or_default()
                    .insert(method, operation_id.clone());
                by_id.insert(operation_id, info);
            }
        }

        Ok(Self {
            by_id,
            by_path,
            security: collapse_security(document, &resolver),
            base_url: document
                .pointer("/servers/0/url")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Look up one operation by its `operationId`.
    pub fn get_operation(&self, operation_id: &str) -> Option<OperationInfo> {
        self.by_id.get(operation_id).cloned()
    }

    /// All operations declared on a path template, keyed by method.
    pub fn get_path(&self, path: &str) -> Option<HashMap<Method, OperationInfo>> {
        let methods = self.by_path.get(path)?;
        Some(
            methods
                .iter()
                .filter_map(|(method, id)| {
                    self.by_id.get(id).map(|info| (method.clone(), info.clone()))
                })
                .collect(),
        )
    }

    pub fn all_operations(&self) -> Vec<OperationInfo> {
        let mut operations: Vec<_> = self.by_id.values().cloned().collect();
        operations.sort_by(|a, b| a.operation_id.cmp(&b.operation_id));
        operations
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// The document-level security requirement, collapsed to bearer/apiKey.
    pub fn security_scheme(&self) -> Option<SecurityScheme> {
        self.security.clone()
    }

    /// First `servers[].url` entry, if declared.
    pub fn base_url(&self) -> Option<String> {
        self.base_url.clone()
    }
}

fn synthesize_operation_id(method: &str, path: &str) -> String {
    let slug: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{method}{slug}").trim_end_matches('_').to_string()
}

fn build_operation(
    resolver: &Resolver<'_>,
    operation_id: String,
    method: Method,
    path: &str,
    op: &serde_json::Map<String, Value>,
    shared_params: &[Value],
) -> OperationInfo {
    let own_params = op
        .get("parameters")
        .map(|params| resolver.resolve(params))
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();

    // Path-level parameters apply unless shadowed by an operation-level
    // parameter with the same (name, location).
    let mut parameters: Vec<ParameterInfo> = Vec::new();
    for raw in shared_params.iter().chain(own_params.iter()) {
        let Some(param) = parse_parameter(raw) else {
            continue;
        };
        if let Some(existing) = parameters
            .iter_mut()
            .find(|p| p.name == param.name && p.location == param.location)
        {
            *existing = param;
        } else {
            parameters.push(param);
        }
    }

    let request_body = op.get("requestBody").map(|body| {
        let body = resolver.resolve(body);
        RequestBodyInfo {
            required: body
                .get("required")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            schema: body
                .pointer("/content/application~1json/schema")
                .cloned(),
        }
    });

    OperationInfo {
        operation_id,
        method,
        path: path.to_string(),
        summary: op.get("summary").and_then(Value::as_str).map(str::to_string),
        description: op
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        parameters,
        request_body,
    }
}

fn parse_parameter(raw: &Value) -> Option<ParameterInfo> {
    let name = raw.get("name")?.as_str()?.to_string();
    let location = ParameterLocation::parse(raw.get("in")?.as_str()?)?;
    Some(ParameterInfo {
        name,
        required: location == ParameterLocation::Path
            || raw.get("required").and_then(Value::as_bool).unwrap_or(false),
        location,
        schema: raw.get("schema").cloned().unwrap_or(Value::Null),
    })
}

fn collapse_security(document: &Value, resolver: &Resolver<'_>) -> Option<SecurityScheme> {
    let schemes = document.pointer("/components/securitySchemes")?.as_object()?;
    // The first scheme the gateway understands wins; multi-scheme documents
    // collapse to their strongest supported requirement.
    let mut names: Vec<_> = schemes.keys().collect();
    names.sort();
    for name in names {
        let scheme = resolver.resolve(schemes.get(name)?);
        match scheme.get("type").and_then(Value::as_str) {
            Some("http") => {
                if scheme.get("scheme").and_then(Value::as_str) == Some("bearer") {
                    return Some(SecurityScheme::Bearer);
                }
            }
            Some("apiKey") => {
                let param = scheme.get("name").and_then(Value::as_str)?;
                let location = scheme
                    .get("in")
                    .and_then(Value::as_str)
                    .and_then(ParameterLocation::parse)?;
                return Some(SecurityScheme::ApiKey {
                    name: param.to_string(),
                    location,
                });
            }
            _ => continue,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "openapi": "3.0.3",
            "info": { "title": "badges", "version": "1.0" },
            "servers": [ { "url": "https://api.example.com/v4" } ],
            "components": {
                "securitySchemes": {
                    "token": { "type": "apiKey", "name": "PRIVATE-TOKEN", "in": "header" }
                },
                "schemas": {
                    "Badge": {
                        "type": "object",
                        "properties": { "id": { "type": "integer" }, "link_url": { "type": "string" } },
                        "required": ["link_url"]
                    }
                }
            },
            "paths": {
                "/projects/{id}/badges": {
                    "parameters": [
                        { "name": "id", "in": "path", "required": true, "schema": { "type": "string" } }
                    ],
                    "get": {
                        "operationId": "listProjectBadges",
                        "parameters": [
                            { "name": "page", "in": "query", "schema": { "type": "integer" } }
                        ],
                        "responses": { "200": { "description": "ok" } }
                    },
                    "post": {
                        "operationId": "addProjectBadge",
                        "requestBody": {
                            "required": true,
                            "content": {
                                "application/json": { "schema": { "$ref": "#/components/schemas/Badge" } }
                            }
                        },
                        "responses": { "201": { "description": "created" } }
                    }
                },
                "/version": {
                    "get": { "responses": { "200": { "description": "ok" } } }
                }
            }
        })
    }

    #[test]
    fn indexes_operations_by_id() {
        let index = OperationIndex::from_document(&document()).unwrap();
        let op = index.get_operation("listProjectBadges").unwrap();
        assert_eq!(op.method, Method::GET);
        assert_eq!(op.path, "/projects/{id}/badges");
        // Path-level `id` plus operation-level `page`.
        assert_eq!(op.parameters.len(), 2);
        assert!(op.parameters.iter().any(|p| p.name == "id"
            && p.location == ParameterLocation::Path
            && p.required));
    }

    #[test]
    fn resolves_request_body_ref() {
        let index = OperationIndex::from_document(&document()).unwrap();
        let op = index.get_operation("addProjectBadge").unwrap();
        let body = op.request_body.unwrap();
        assert!(body.required);
        let schema = body.schema.unwrap();
        assert_eq!(schema.pointer("/properties/link_url/type"), Some(&json!("string")));
    }

    #[test]
    fn path_lookup_returns_all_methods() {
        let index = OperationIndex::from_document(&document()).unwrap();
        let methods = index.get_path("/projects/{id}/badges").unwrap();
        assert_eq!(methods.len(), 2);
        assert!(methods.contains_key(&Method::GET));
        assert!(methods.contains_key(&Method::POST));
    }

    #[test]
    fn synthesizes_missing_operation_ids() {
        let index = OperationIndex::from_document(&document()).unwrap();
        assert!(index.get_operation("get_version").is_some());
    }

    #[test]
    fn collapses_api_key_security() {
        let index = OperationIndex::from_document(&document()).unwrap();
        assert_eq!(
            index.security_scheme(),
            Some(SecurityScheme::ApiKey {
                name: "PRIVATE-TOKEN".to_string(),
                location: ParameterLocation::Header,
            })
        );
    }

    #[test]
    fn exposes_base_url() {
        let index = OperationIndex::from_document(&document()).unwrap();
        assert_eq!(index.base_url().as_deref(), Some("https://api.example.com/v4"));
    }

    #[test]
    fn rejects_swagger_2_documents() {
        let doc = json!({ "swagger": "2.0", "paths": {} });
        assert!(matches!(
            OperationIndex::from_document(&doc),
            Err(IndexError::UnsupportedVersion(None))
        ));
    }

    #[test]
    fn views_are_deep_clones() {
        let index = OperationIndex::from_document(&document()).unwrap();
        let mut op = index.get_operation("listProjectBadges").unwrap();
        op.parameters.clear();
        let fresh = index.get_operation("listProjectBadges").unwrap();
        assert_eq!(fresh.parameters.len(), 2);
    }
}
