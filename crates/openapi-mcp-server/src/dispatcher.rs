//! Wires incoming MCP requests through the tool model, request builder,
//! composite executor, and upstream client. The only place gateway errors
//! are converted into JSON-RPC envelopes.

use std::sync::Arc;
use std::time::Instant;

use openapi_mcp_index::OperationIndex;
use serde_json::{Map, Value, json};
use tracing::{debug, error};

use crate::client_factory::HttpClientFactory;
use crate::composite::CompositeExecutor;
use crate::errors::{GatewayError, new_correlation_id};
use crate::metrics;
use crate::request::{RequestBuilder, filter_response_fields};
use crate::session::SessionStore;
use crate::tools::ToolRegistry;

pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub struct Dispatcher {
    tools: Arc<ToolRegistry>,
    index: Arc<OperationIndex>,
    builder: RequestBuilder,
    factory: Arc<HttpClientFactory>,
    sessions: Arc<SessionStore>,
}

impl Dispatcher {
    pub fn new(
        tools: Arc<ToolRegistry>,
        index: Arc<OperationIndex>,
        builder: RequestBuilder,
        factory: Arc<HttpClientFactory>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            tools,
            index,
            builder,
            factory,
            sessions,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// The `initialize` result payload shared by both transports.
    pub fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        })
    }

    pub fn list_tools_result(&self) -> Value {
        json!({ "tools": self.tools.descriptors() })
    }

    /// Run one tool call end to end and return the raw result value.
    pub async fn call_tool(
        &self,
        name: &str,
        args: Map<String, Value>,
        session_id: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let started = Instant::now();
        let result = self.call_tool_inner(name, &args, session_id).await;
        metrics::record_tool_call(name, result.is_ok(), started.elapsed().as_secs_f64());
        result
    }

    async fn call_tool_inner(
        &self,
        name: &str,
        args: &Map<String, Value>,
        session_id: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| GatewayError::operation_not_found(format!("tool {name:?} not found")))?;

        tool.validate(args)?;

        let client = match session_id {
            Some(id) => {
                let token = self.sessions.auth_token(id)?;
                self.factory.get_or_create_for_session(id, token)?
            }
            None => self.factory.global().ok_or_else(|| {
                GatewayError::configuration("no global upstream client configured")
            })?,
        };

        if tool.spec.is_composite() {
            let executor = CompositeExecutor::new(&self.index, &self.builder, &client);
            return executor.execute(&tool.spec, args).await;
        }

        let action = args.get("action").and_then(Value::as_str).map(str::to_string);
        let operation_id = tool.map_action_to_operation(args).ok_or_else(|| {
            GatewayError::validation(format!(
                "no operation mapped for these arguments; known operation keys: {}",
                tool.operation_keys().join(", ")
            ))
        })?;
        let operation = self.index.get_operation(&operation_id).ok_or_else(|| {
            GatewayError::operation_not_found(format!(
                "operationId {operation_id:?} is not in the OpenAPI document"
            ))
        })?;

        let ctx = self.builder.build(&operation, &tool.spec, args)?;
        let response = client.execute(ctx).await?;
        debug!(tool = name, operation_id = %operation_id, status = response.status, "tool call completed");
        Ok(filter_response_fields(&tool.spec, action.as_deref(), response.body))
    }

    /// Handle one JSON-RPC message. Returns `None` for notifications and
    /// client responses, which produce no reply.
    pub async fn handle_message(&self, message: &Value, session_id: Option<&str>) -> Option<Value> {
        let method = message.get("method").and_then(Value::as_str);
        let id = message.get("id").cloned();

        let Some(method) = method else {
            // A bare response from the client; nothing to do.
            return None;
        };
        let Some(id) = id.filter(|id| !id.is_null()) else {
            debug!(method, "notification received");
            return None;
        };

        let reply = match method {
            "initialize" => Ok(self.initialize_result()),
            "tools/list" => Ok(self.list_tools_result()),
            "tools/call" => {
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let args = params
                    .get("arguments")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                match name {
                    Some(name) => self
                        .call_tool(&name, args, session_id)
                        .await
                        .map(tool_result_content),
                    None => Err(GatewayError::validation("tools/call requires params.name")),
                }
            }
            "ping" => Ok(json!({})),
            other => Err(GatewayError::operation_not_found(format!(
                "Method not found: {other}"
            ))),
        };

        Some(match reply {
            Ok(result) => jsonrpc_result(id, result),
            Err(err) => {
                let correlation_id = new_correlation_id();
                error!(
                    correlation_id = %correlation_id,
                    code = err.code(),
                    method,
                    detail = ?err.detail(),
                    "dispatch failed: {err}"
                );
                jsonrpc_error(
                    id,
                    err.jsonrpc_code(),
                    err.format_for_client(&correlation_id),
                    err.detail().cloned(),
                )
            }
        })
    }
}

/// Package a tool result as an MCP content item.
pub fn tool_result_content(result: Value) -> Value {
    let text = serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
    json!({ "content": [ { "type": "text", "text": text } ] })
}

pub fn jsonrpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn jsonrpc_error(id: Value, code: i32, message: String, data: Option<Value>) -> Value {
    let mut error = Map::new();
    error.insert("code".to_string(), json!(code));
    error.insert("message".to_string(), json!(message));
    if let Some(data) = data {
        error.insert("data".to_string(), data);
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": Value::Object(error) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{InterceptorConfig, Profile};
    use crate::sanitize::Sanitizer;
    use crate::tools::ToolRegistry;
    use std::time::Duration;

    fn profile() -> Profile {
        serde_json::from_value(json!({
            "profile_name": "badges",
            "tools": [
                {
                    "name": "manage_project_badges",
                    "description": "Manage project badges",
                    "parameters": {
                        "action": { "type": "string", "required": true, "enum": ["list"] },
                        "project_id": { "type": "string", "required": true }
                    },
                    "operations": { "list": "listProjectBadges" },
                    "response_fields": { "list": ["id", "link_url"] }
                }
            ]
        }))
        .unwrap()
    }

    fn index() -> OperationIndex {
        let doc = json!({
            "openapi": "3.0.0",
            "paths": {
                "/projects/{project_id}/badges": {
                    "get": {
                        "operationId": "listProjectBadges",
                        "parameters": [
                            { "name": "project_id", "in": "path", "required": true,
                              "schema": { "type": "string" } }
                        ]
                    }
                }
            }
        });
        OperationIndex::from_document(&doc).unwrap()
    }

    fn dispatcher(upstream_url: &str) -> Dispatcher {
        let profile = profile();
        profile.validate().unwrap();
        let tools = Arc::new(ToolRegistry::from_profile(&profile));
        let factory = Arc::new(HttpClientFactory::new(
            InterceptorConfig::default(),
            Duration::from_secs(5),
            Sanitizer::default(),
        ));
        factory.create_global().unwrap();
        Dispatcher::new(
            tools,
            Arc::new(index()),
            RequestBuilder::new(upstream_url.parse().unwrap()),
            factory,
            Arc::new(SessionStore::new(Duration::from_secs(1800))),
        )
    }

    #[tokio::test]
    async fn initialize_reports_protocol_version() {
        let d = dispatcher("https://unused.example.com");
        let reply = d
            .handle_message(&json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }), None)
            .await
            .unwrap();
        assert_eq!(
            reply.pointer("/result/protocolVersion"),
            Some(&json!(PROTOCOL_VERSION))
        );
        assert_eq!(reply.pointer("/id"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn tools_list_is_non_empty() {
        let d = dispatcher("https://unused.example.com");
        let reply = d
            .handle_message(&json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }), None)
            .await
            .unwrap();
        let tools = reply.pointer("/result/tools").and_then(Value::as_array).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].pointer("/name"), Some(&json!("manage_project_badges")));
    }

    #[tokio::test]
    async fn simple_call_hits_upstream_and_trims_fields() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/projects/org%2Fproj/badges")
            .with_status(200)
            .with_body(
                json!([
                    { "id": 1, "link_url": "https://ci", "kind": "project" }
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let d = dispatcher(&server.url());
        let result = d
            .call_tool(
                "manage_project_badges",
                json!({ "project_id": "org/proj", "action": "list" })
                    .as_object()
                    .cloned()
                    .unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, json!([{ "id": 1, "link_url": "https://ci" }]));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let d = dispatcher("https://unused.example.com");
        let reply = d
            .handle_message(&json!({ "jsonrpc": "2.0", "id": 3, "method": "resources/list" }), None)
            .await
            .unwrap();
        assert_eq!(reply.pointer("/error/code"), Some(&json!(-32601)));
    }

    #[tokio::test]
    async fn validation_failure_is_invalid_params_with_correlation_id() {
        let d = dispatcher("https://unused.example.com");
        let reply = d
            .handle_message(
                &json!({
                    "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                    "params": { "name": "manage_project_badges", "arguments": { "action": "list" } }
                }),
                None,
            )
            .await
            .unwrap();
        assert_eq!(reply.pointer("/error/code"), Some(&json!(-32602)));
        let message = reply
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap();
        assert!(message.contains("correlation ID"));
    }

    #[tokio::test]
    async fn notifications_produce_no_reply() {
        let d = dispatcher("https://unused.example.com");
        let reply = d
            .handle_message(
                &json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
                None,
            )
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let d = dispatcher("https://unused.example.com");
        let err = d
            .call_tool("no_such_tool", Map::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.jsonrpc_code(), -32601);
    }
}
