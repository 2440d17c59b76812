use http::Method;
use serde_json::Value;

/// Where a parameter is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterLocation {
    Path,
    Query,
    Header,
    Cookie,
}

impl ParameterLocation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "path" => Some(Self::Path),
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            "cookie" => Some(Self::Cookie),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Cookie => "cookie",
        }
    }
}

/// A single declared operation parameter with its resolved schema.
#[derive(Debug, Clone)]
pub struct ParameterInfo {
    pub name: String,
    pub location: ParameterLocation,
    pub required: bool,
    pub schema: Value,
}

/// The declared request body, if any.
#[derive(Debug, Clone)]
pub struct RequestBodyInfo {
    pub required: bool,
    /// Resolved JSON schema of the `application/json` content, if declared.
    pub schema: Option<Value>,
}

/// A fully resolved view of one OpenAPI operation.
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub operation_id: String,
    pub method: Method,
    /// Path template with `{name}` placeholders, e.g. `/projects/{id}/badges`.
    pub path: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    /// Declared parameters in document order; path-level parameters first
    /// unless overridden by an operation-level parameter of the same
    /// `(name, location)`.
    pub parameters: Vec<ParameterInfo>,
    pub request_body: Option<RequestBodyInfo>,
}

impl OperationInfo {
    /// Parameters carried in the given location.
    pub fn parameters_in(&self, location: ParameterLocation) -> impl Iterator<Item = &ParameterInfo> {
        self.parameters.iter().filter(move |p| p.location == location)
    }
}

/// The document's security requirement, collapsed to the two shapes the
/// gateway can satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityScheme {
    /// `type: http, scheme: bearer`
    Bearer,
    /// `type: apiKey` with its parameter name and location.
    ApiKey {
        name: String,
        location: ParameterLocation,
    },
}
