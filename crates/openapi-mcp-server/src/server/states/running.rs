//! The running state for the stdio transport: an rmcp `ServerHandler` that
//! delegates protocol work to the shared dispatcher.

use std::sync::Arc;

use rmcp::{
    RoleServer, ServerHandler,
    model::{
        CallToolRequestParam, CallToolResult, Content, Implementation, InitializeRequestParam,
        InitializeResult, ListToolsResult, PaginatedRequestParam, ServerCapabilities, ServerInfo,
    },
    service::RequestContext,
};

use crate::dispatcher::Dispatcher;
use crate::errors::McpError;

#[derive(Clone)]
pub(crate) struct Running {
    pub(crate) dispatcher: Arc<Dispatcher>,
}

impl ServerHandler for Running {
    #[tracing::instrument(skip_all, fields(client_name = request.client_info.name))]
    async fn initialize(
        &self,
        request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        tracing::debug!(client = %request.client_info.name, "stdio client initialized");
        Ok(self.get_info())
    }

    #[tracing::instrument(skip_all, fields(tool_name = request.name.as_ref()))]
    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let args = request.arguments.clone().unwrap_or_default();
        let result = self
            .dispatcher
            .call_tool(request.name.as_ref(), args, None)
            .await
            .map_err(|e| e.into_mcp_error())?;
        let text = serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    #[tracing::instrument(skip_all)]
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            next_cursor: None,
            tools: self.dispatcher.tools().descriptors(),
        })
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                icons: None,
                title: Some("OpenAPI MCP Gateway".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                website_url: None,
            },
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
