//! The closed error set of the gateway, with stable codes, correlation ids,
//! and safe client-facing projections.

use rmcp::model::ErrorCode;
use serde_json::Value;
use thiserror::Error;

/// MCP protocol error type returned to rmcp-transported clients.
pub type McpError = rmcp::model::ErrorData;

/// Every failure the gateway can surface. The dispatcher is the single place
/// that converts these into JSON-RPC errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{message}")]
    Validation {
        message: String,
        detail: Option<Value>,
    },

    #[error("{message}")]
    OperationNotFound { message: String },

    #[error("{message}")]
    Parameter { message: String },

    #[error("{message}")]
    Authentication { message: String },

    #[error("{message}")]
    Authorization { message: String },

    #[error("{message}")]
    RateLimit {
        message: String,
        /// Seconds parsed from an upstream `Retry-After` header, if present.
        retry_after: Option<u64>,
    },

    /// Upstream 4xx other than 401/403/429.
    #[error("{message}")]
    Client { status: u16, message: String },

    /// Upstream 5xx or transport failure.
    #[error("{message}")]
    Server {
        status: Option<u16>,
        message: String,
    },

    #[error("{message}")]
    Configuration { message: String },

    #[error("{message}")]
    Session { message: String },

    #[error("{message}")]
    Storage { message: String },
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            detail: None,
        }
    }

    pub fn validation_with_detail(message: impl Into<String>, detail: Value) -> Self {
        Self::Validation {
            message: message.into(),
            detail: Some(detail),
        }
    }

    pub fn operation_not_found(message: impl Into<String>) -> Self {
        Self::OperationNotFound {
            message: message.into(),
        }
    }

    pub fn parameter(message: impl Into<String>) -> Self {
        Self::Parameter {
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for logs and structured responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::OperationNotFound { .. } => "OPERATION_NOT_FOUND",
            Self::Parameter { .. } => "PARAMETER_ERROR",
            Self::Authentication { .. } => "AUTHENTICATION_ERROR",
            Self::Authorization { .. } => "AUTHORIZATION_ERROR",
            Self::RateLimit { .. } => "RATE_LIMIT_ERROR",
            Self::Client { status: 404, .. } => "NOT_FOUND",
            Self::Client { .. } => "CLIENT_ERROR",
            Self::Server { .. } => "SERVER_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Session { .. } => "SESSION_ERROR",
            Self::Storage { .. } => "STORAGE_ERROR",
        }
    }

    /// JSON-RPC error code this kind maps to.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::OperationNotFound { .. } => -32601,
            Self::Validation { .. } | Self::Parameter { .. } => -32602,
            Self::Authentication { .. } => -32001,
            Self::Authorization { .. } => -32002,
            Self::RateLimit { .. } => -32003,
            _ => -32603,
        }
    }

    pub fn detail(&self) -> Option<&Value> {
        match self {
            Self::Validation { detail, .. } => detail.as_ref(),
            _ => None,
        }
    }

    /// The message a client is allowed to see. Internal failures collapse to
    /// a generic message; everything else keeps its text. The correlation id
    /// is always included so the user can hand it back to an operator.
    pub fn format_for_client(&self, correlation_id: &str) -> String {
        match self {
            Self::Validation { message, .. }
            | Self::OperationNotFound { message }
            | Self::Parameter { message }
            | Self::Authentication { message }
            | Self::Authorization { message }
            | Self::Configuration { message }
            | Self::Client { message, .. } => {
                format!("{message} (correlation ID: {correlation_id})")
            }
            Self::RateLimit {
                message,
                retry_after,
            } => match retry_after {
                Some(seconds) => format!(
                    "{message}. Retry after {seconds} seconds (correlation ID: {correlation_id})"
                ),
                None => format!("{message} (correlation ID: {correlation_id})"),
            },
            Self::Session { message } => {
                format!("{message} (correlation ID: {correlation_id})")
            }
            Self::Storage { message } => {
                format!("{message} (correlation ID: {correlation_id})")
            }
            Self::Server { .. } => {
                format!("Internal error (correlation ID: {correlation_id})")
            }
        }
    }

    /// Wrap into an MCP error, logging the full detail under the correlation
    /// id and exposing only the safe projection.
    pub fn into_mcp_error(self) -> McpError {
        let correlation_id = new_correlation_id();
        tracing::error!(
            correlation_id = %correlation_id,
            code = self.code(),
            detail = ?self.detail(),
            "request failed: {self}"
        );
        McpError::new(
            ErrorCode(self.jsonrpc_code()),
            self.format_for_client(&correlation_id),
            self.detail().cloned(),
        )
    }
}

/// Opaque id linking a user-visible failure to its log records. Generated
/// lazily, only on failure paths.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
