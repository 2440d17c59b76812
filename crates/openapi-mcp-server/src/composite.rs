//! Executes composite tools: a declared DAG of dependent API calls with
//! level-parallel fan-out and partial-result semantics.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use openapi_mcp_index::OperationIndex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::errors::GatewayError;
use crate::profile::{CompositeStep, ToolSpec};
use crate::request::RequestBuilder;
use crate::upstream::UpstreamClient;

/// One failed step, kept both in the error list and as a `<store_as>_error`
/// sibling inside the data tree.
#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub step_index: usize,
    pub step_call: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub struct CompositeExecutor<'a> {
    index: &'a OperationIndex,
    builder: &'a RequestBuilder,
    client: &'a UpstreamClient,
}

impl<'a> CompositeExecutor<'a> {
    pub fn new(
        index: &'a OperationIndex,
        builder: &'a RequestBuilder,
        client: &'a UpstreamClient,
    ) -> Self {
        Self {
            index,
            builder,
            client,
        }
    }

    /// Run all steps of `tool`, honoring dependency order. Steps whose
    /// dependencies are all in earlier levels run concurrently; a level is
    /// fully settled before the next one starts, so a dependent step's
    /// request is never issued before its dependency's response landed.
    pub async fn execute(
        &self,
        tool: &ToolSpec,
        args: &Map<String, Value>,
    ) -> Result<Value, GatewayError> {
        let steps = tool.steps.as_deref().unwrap_or_default();
        let total_steps = steps.len();
        let allow_partial = tool.partial_results;

        let mut data = Map::new();
        let mut errors: Vec<StepError> = Vec::new();
        let mut completed = 0usize;

        for level in levels(steps) {
            let results = join_all(level.into_iter().map(|(idx, step)| async move {
                (idx, step, self.run_step(step, tool, args).await)
            }))
            .await;

            for (idx, step, outcome) in results {
                match outcome {
                    Ok(body) => {
                        store_at(&mut data, &step.store_as, body)?;
                        completed += 1;
                    }
                    Err(err) => {
                        let step_error = StepError {
                            step_index: idx,
                            step_call: step.call.clone(),
                            message: err.to_string(),
                            timestamp: Utc::now(),
                        };
                        debug!(
                            step = %step.store_as,
                            error = %step_error.message,
                            "composite step failed"
                        );
                        store_at(
                            &mut data,
                            &error_key(&step.store_as),
                            serde_json::to_value(&step_error)
                                .unwrap_or_else(|_| json!(step_error.message)),
                        )?;
                        if !allow_partial {
                            return Err(prefix_step_failure(err, idx + 1, total_steps));
                        }
                        errors.push(step_error);
                    }
                }
            }
        }

        let mut result = Map::new();
        result.insert("data".to_string(), Value::Object(data));
        result.insert("completed_steps".to_string(), json!(completed));
        result.insert("total_steps".to_string(), json!(total_steps));
        if !errors.is_empty() {
            result.insert(
                "errors".to_string(),
                serde_json::to_value(&errors).unwrap_or_default(),
            );
        }
        Ok(Value::Object(result))
    }

    async fn run_step(
        &self,
        step: &CompositeStep,
        tool: &ToolSpec,
        args: &Map<String, Value>,
    ) -> Result<Value, GatewayError> {
        let (method, path) = step.parse_call()?;
        let operation = self
            .index
            .get_path(path)
            .and_then(|mut by_method| by_method.remove(&method))
            .ok_or_else(|| {
                GatewayError::operation_not_found(format!(
                    "no operation for {} {path}",
                    step.call.split(' ').next().unwrap_or_default()
                ))
            })?;
        let ctx = self.builder.build(&operation, tool, args)?;
        let response = self.client.execute(ctx).await?;
        Ok(response.body)
    }
}

/// Group steps into dependency levels, keeping their original indices for
/// error reporting. Validation already guarantees acyclicity and that every
/// dependency exists, so this always terminates with every step placed.
fn levels(steps: &[CompositeStep]) -> Vec<Vec<(usize, &CompositeStep)>> {
    let mut pending: Vec<(usize, &CompositeStep)> = steps.iter().enumerate().collect();
    let mut done: Vec<&str> = Vec::new();
    let mut levels = Vec::new();

    while !pending.is_empty() {
        let (ready, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(_, step)| {
            step.depends_on
                .iter()
                .all(|dep| done.iter().any(|d| d == dep))
        });
        if ready.is_empty() {
            // Unreachable after profile validation; bail rather than spin.
            break;
        }
        done.extend(ready.iter().map(|(_, step)| step.store_as.as_str()));
        pending = rest;
        levels.push(ready);
    }
    levels
}

fn error_key(store_as: &str) -> String {
    match store_as.rsplit_once('.') {
        Some((prefix, last)) => format!("{prefix}.{last}_error"),
        None => format!("{store_as}_error"),
    }
}

/// Write `value` at a dot path, creating intermediate objects. Traversing
/// into a non-object is a storage error naming the offending prefix.
fn store_at(data: &mut Map<String, Value>, path: &str, value: Value) -> Result<(), GatewayError> {
    let mut segments = path.split('.').peekable();
    let mut current = data;
    let mut prefix = String::new();

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return Ok(());
        }
        if !prefix.is_empty() {
            prefix.push('.');
        }
        prefix.push_str(segment);

        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(obj) => current = obj,
            other => {
                return Err(GatewayError::storage(format!(
                    "cannot store at {path}: {prefix} is {}, not an object",
                    json_kind(other)
                )));
            }
        }
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Re-wrap a step failure with the `k/N` prefix, preserving the error kind
/// so the dispatcher still maps it to the right JSON-RPC code.
fn prefix_step_failure(err: GatewayError, k: usize, n: usize) -> GatewayError {
    let message = format!("Composite step {k}/{n} failed: {err}");
    match err {
        GatewayError::Validation { detail, .. } => GatewayError::Validation { message, detail },
        GatewayError::OperationNotFound { .. } => GatewayError::OperationNotFound { message },
        GatewayError::Parameter { .. } => GatewayError::Parameter { message },
        GatewayError::Authentication { .. } => GatewayError::Authentication { message },
        GatewayError::Authorization { .. } => GatewayError::Authorization { message },
        GatewayError::RateLimit { retry_after, .. } => GatewayError::RateLimit {
            message,
            retry_after,
        },
        GatewayError::Client { status, .. } => GatewayError::Client { status, message },
        GatewayError::Server { status, .. } => GatewayError::Client {
            status: status.unwrap_or(502),
            message,
        },
        GatewayError::Configuration { .. } => GatewayError::Configuration { message },
        GatewayError::Session { .. } => GatewayError::Session { message },
        GatewayError::Storage { .. } => GatewayError::Storage { message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::InterceptorConfig;
    use crate::sanitize::Sanitizer;
    use serde_json::json;
    use std::time::Duration;

    fn steps(value: Value) -> Vec<CompositeStep> {
        serde_json::from_value(value).unwrap()
    }

    fn level_indices(steps: &[CompositeStep]) -> Vec<Vec<usize>> {
        levels(steps)
            .into_iter()
            .map(|level| level.into_iter().map(|(idx, _)| idx).collect())
            .collect()
    }

    #[test]
    fn levels_respect_dependencies() {
        let steps = steps(json!([
            { "call": "GET /projects/1", "store_as": "project" },
            { "call": "GET /merge_requests", "store_as": "mrs", "depends_on": ["project"] },
            { "call": "GET /issues", "store_as": "issues", "depends_on": ["project"] },
            { "call": "GET /comments", "store_as": "comments", "depends_on": ["mrs", "issues"] }
        ]));
        assert_eq!(level_indices(&steps), vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn independent_steps_share_one_level() {
        let steps = steps(json!([
            { "call": "GET /a", "store_as": "a" },
            { "call": "GET /b", "store_as": "b" }
        ]));
        assert_eq!(level_indices(&steps), vec![vec![0, 1]]);
    }

    #[test]
    fn store_at_creates_intermediate_objects() {
        let mut data = Map::new();
        store_at(&mut data, "project.details.name", json!("x")).unwrap();
        assert_eq!(
            Value::Object(data).pointer("/project/details/name"),
            Some(&json!("x"))
        );
    }

    #[test]
    fn store_at_rejects_scalar_prefix() {
        let mut data = Map::new();
        store_at(&mut data, "project", json!("scalar")).unwrap();
        let err = store_at(&mut data, "project.details", json!({})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot store at project.details: project is string, not an object"
        );
        assert!(matches!(err, GatewayError::Storage { .. }));
    }

    #[test]
    fn error_key_appends_to_last_segment() {
        assert_eq!(error_key("issues"), "issues_error");
        assert_eq!(error_key("project.issues"), "project.issues_error");
    }

    fn overview_tool(partial: bool) -> ToolSpec {
        serde_json::from_value(json!({
            "name": "project_overview",
            "composite": true,
            "partial_results": partial,
            "steps": [
                { "call": "GET /projects", "store_as": "projects" },
                { "call": "GET /issues", "store_as": "issues", "depends_on": ["projects"] }
            ]
        }))
        .unwrap()
    }

    async fn fixture(
        server: &mockito::ServerGuard,
    ) -> (OperationIndex, RequestBuilder, UpstreamClient) {
        let doc = json!({
            "openapi": "3.0.0",
            "paths": {
                "/projects": { "get": { "operationId": "listProjects" } },
                "/issues": { "get": { "operationId": "listIssues" } }
            }
        });
        let index = OperationIndex::from_document(&doc).unwrap();
        let builder = RequestBuilder::new(server.url().parse().unwrap());
        let client = UpstreamClient::build(
            &InterceptorConfig::default(),
            None,
            Duration::from_secs(5),
            Sanitizer::default(),
        )
        .unwrap();
        (index, builder, client)
    }

    #[tokio::test]
    async fn aggregates_all_steps_on_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/projects")
            .with_status(200)
            .with_body(r#"[{"id":1}]"#)
            .create_async()
            .await;
        server
            .mock("GET", "/issues")
            .with_status(200)
            .with_body(r#"[{"iid":9}]"#)
            .create_async()
            .await;

        let (index, builder, client) = fixture(&server).await;
        let executor = CompositeExecutor::new(&index, &builder, &client);
        let result = executor
            .execute(&overview_tool(false), &Map::new())
            .await
            .unwrap();

        assert_eq!(result.pointer("/completed_steps"), Some(&json!(2)));
        assert_eq!(result.pointer("/total_steps"), Some(&json!(2)));
        assert_eq!(result.pointer("/data/projects"), Some(&json!([{"id": 1}])));
        assert_eq!(result.pointer("/data/issues"), Some(&json!([{"iid": 9}])));
        assert!(result.pointer("/errors").is_none());
    }

    #[tokio::test]
    async fn strict_mode_names_the_failing_step() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/projects")
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;
        server
            .mock("GET", "/issues")
            .with_status(500)
            .with_body(r#"{"message":"boom"}"#)
            .create_async()
            .await;

        let (index, builder, client) = fixture(&server).await;
        let executor = CompositeExecutor::new(&index, &builder, &client);
        let err = executor
            .execute(&overview_tool(false), &Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Composite step 2/2 failed:"));
    }

    #[tokio::test]
    async fn partial_mode_keeps_going_and_records_the_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/projects")
            .with_status(200)
            .with_body(r#"[{"id":1}]"#)
            .create_async()
            .await;
        server
            .mock("GET", "/issues")
            .with_status(500)
            .with_body(r#"{"message":"boom"}"#)
            .create_async()
            .await;

        let (index, builder, client) = fixture(&server).await;
        let executor = CompositeExecutor::new(&index, &builder, &client);
        let result = executor
            .execute(&overview_tool(true), &Map::new())
            .await
            .unwrap();

        assert_eq!(result.pointer("/completed_steps"), Some(&json!(1)));
        assert_eq!(result.pointer("/total_steps"), Some(&json!(2)));
        assert_eq!(result.pointer("/errors/0/step_index"), Some(&json!(1)));
        assert!(result.pointer("/data/issues_error").is_some());
        assert!(result.pointer("/data/issues").is_none());
    }
}
