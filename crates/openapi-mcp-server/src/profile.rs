//! Profile configuration: the declarative mapping from abstract tools to
//! concrete OpenAPI operations, loaded once at startup and validated before
//! anything else runs. A rejected profile is a fatal configuration error
//! naming the offending tool and field.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::errors::GatewayError;

fn default_metadata_params() -> Vec<String> {
    vec!["action".to_string(), "resource_type".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub profile_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub interceptors: InterceptorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    /// Simple tools: `operation_key -> operationId`.
    #[serde(default)]
    pub operations: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub composite: bool,
    #[serde(default)]
    pub steps: Option<Vec<CompositeStep>>,
    /// Arguments that drive dispatch and never reach the request body.
    #[serde(default = "default_metadata_params")]
    pub metadata_params: Vec<String>,
    /// Per-action projection of upstream responses to the named top-level keys.
    #[serde(default)]
    pub response_fields: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub partial_results: bool,
    /// Canonical path-parameter name -> ordered accepted substitutes.
    #[serde(default)]
    pub parameter_aliases: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Whether a JSON value inhabits this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    /// Actions for which this otherwise-optional parameter becomes required.
    #[serde(default)]
    pub required_for: Vec<String>,
    #[serde(default, rename = "enum")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default)]
    pub items: Option<ItemsSpec>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub example: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemsSpec {
    #[serde(rename = "type")]
    pub item_type: ParamType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompositeStep {
    /// `"METHOD /path/template"`.
    pub call: String,
    /// Dot path into the aggregate result object.
    pub store_as: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl CompositeStep {
    /// Split `call` into its method and path template parts.
    pub fn parse_call(&self) -> Result<(http::Method, &str), GatewayError> {
        let mut parts = self.call.splitn(2, ' ');
        let method = parts
            .next()
            .and_then(|m| m.parse::<http::Method>().ok())
            .ok_or_else(|| {
                GatewayError::validation(format!("invalid step call {:?}", self.call))
            })?;
        let path = parts
            .next()
            .filter(|p| p.starts_with('/'))
            .ok_or_else(|| {
                GatewayError::validation(format!("invalid step call {:?}", self.call))
            })?;
        Ok((method, path))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterceptorConfig {
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub base_url: Option<BaseUrlConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub array_format: ArrayFormat,
}

/// One auth spec, or a priority-ordered list of candidates.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AuthConfig {
    One(AuthSpec),
    Many(Vec<AuthSpec>),
}

impl AuthConfig {
    pub fn specs(&self) -> Vec<&AuthSpec> {
        match self {
            Self::One(spec) => vec![spec],
            Self::Many(specs) => specs.iter().collect(),
        }
    }

    /// The non-OAuth spec with the lowest priority number, if any. This is
    /// the one the interceptor chain applies; OAuth specs are handled at the
    /// transport layer.
    pub fn primary(&self) -> Option<&AuthSpec> {
        self.specs()
            .into_iter()
            .filter(|spec| !spec.is_oauth())
            .min_by_key(|spec| spec.priority())
    }

    pub fn oauth(&self) -> Option<&crate::oauth::OAuthConfig> {
        self.specs().into_iter().find_map(|spec| match spec {
            AuthSpec::Oauth { config, .. } => Some(config),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthSpec {
    Bearer {
        value_from_env: String,
        #[serde(default)]
        priority: i32,
        #[serde(default)]
        validation_endpoint: Option<Url>,
        #[serde(default)]
        validation_timeout_ms: Option<u64>,
    },
    Query {
        value_from_env: String,
        query_param: String,
        #[serde(default)]
        priority: i32,
        #[serde(default)]
        validation_endpoint: Option<Url>,
        #[serde(default)]
        validation_timeout_ms: Option<u64>,
    },
    CustomHeader {
        value_from_env: String,
        header_name: String,
        #[serde(default)]
        priority: i32,
        #[serde(default)]
        validation_endpoint: Option<Url>,
        #[serde(default)]
        validation_timeout_ms: Option<u64>,
    },
    Oauth {
        #[serde(flatten)]
        config: crate::oauth::OAuthConfig,
        #[serde(default)]
        priority: i32,
    },
}

impl AuthSpec {
    pub fn priority(&self) -> i32 {
        match self {
            Self::Bearer { priority, .. }
            | Self::Query { priority, .. }
            | Self::CustomHeader { priority, .. }
            | Self::Oauth { priority, .. } => *priority,
        }
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self, Self::Oauth { .. })
    }

    pub fn value_from_env(&self) -> Option<&str> {
        match self {
            Self::Bearer { value_from_env, .. }
            | Self::Query { value_from_env, .. }
            | Self::CustomHeader { value_from_env, .. } => Some(value_from_env),
            Self::Oauth { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BaseUrlConfig {
    /// Environment variable consulted first.
    #[serde(default)]
    pub env_var: Option<String>,
    /// Fallback when the variable is unset; the OpenAPI `servers` entry is
    /// the last resort.
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Global token bucket capacity.
    pub max_requests_per_minute: u32,
    /// Per-operationId overrides, same unit.
    #[serde(default)]
    pub operation_overrides: HashMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Backoff before attempt N+1 is `backoff_ms[N]`; the last entry repeats.
    #[serde(default)]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "RetryConfig::default_retry_on_status")]
    pub retry_on_status: Vec<u16>,
}

impl RetryConfig {
    fn default_retry_on_status() -> Vec<u16> {
        vec![429, 502, 503, 504]
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> u64 {
        if self.backoff_ms.is_empty() {
            return 0;
        }
        let idx = (attempt as usize).min(self.backoff_ms.len() - 1);
        self.backoff_ms.get(idx).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayFormat {
    Brackets,
    Indices,
    #[default]
    Repeat,
    Comma,
}

impl Profile {
    /// Load a profile from a JSON file and run the semantic checks.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::configuration(format!(
                "cannot read profile {}: {e}",
                path.display()
            ))
        })?;
        let profile: Profile = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::configuration(format!(
                "invalid profile {}: {e}",
                path.display()
            ))
        })?;
        profile.validate()?;
        Ok(profile)
    }

    /// Semantic checks over the whole tree. All violations are configuration
    /// errors naming the tool and field.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.profile_name.trim().is_empty() {
            return Err(GatewayError::configuration("profile_name must not be empty"));
        }
        if self.tools.is_empty() {
            return Err(GatewayError::configuration(format!(
                "profile {:?} declares no tools",
                self.profile_name
            )));
        }
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(GatewayError::configuration(format!(
                    "duplicate tool name {:?}",
                    tool.name
                )));
            }
            tool.validate()?;
        }
        Ok(())
    }
}

impl ToolSpec {
    pub fn is_composite(&self) -> bool {
        self.composite
    }

    /// Enum values of a string parameter, as owned strings.
    pub fn enum_of(&self, param: &str) -> Vec<String> {
        self.parameters
            .get(param)
            .and_then(|spec| spec.enum_values.as_ref())
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::configuration("tool name must not be empty"));
        }

        let has_operations = self
            .operations
            .as_ref()
            .is_some_and(|ops| !ops.is_empty());
        let has_steps = self.steps.as_ref().is_some_and(|s| !s.is_empty());

        match (self.composite, has_operations, has_steps) {
            (false, true, false) => self.validate_operations()?,
            (true, false, true) => self.validate_steps()?,
            (true, _, false) => {
                return Err(GatewayError::configuration(format!(
                    "tool {:?}: composite=true requires non-empty steps",
                    self.name
                )));
            }
            (false, false, _) => {
                return Err(GatewayError::configuration(format!(
                    "tool {:?}: needs either operations or composite steps",
                    self.name
                )));
            }
            _ => {
                return Err(GatewayError::configuration(format!(
                    "tool {:?}: operations and steps are mutually exclusive",
                    self.name
                )));
            }
        }

        // Every action a parameter is conditionally required for must be a
        // declared action.
        let actions = self.enum_of("action");
        for (param_name, spec) in &self.parameters {
            for action in &spec.required_for {
                if !actions.iter().any(|a| a == action) {
                    return Err(GatewayError::configuration(format!(
                        "tool {:?}: parameter {:?} is required_for unknown action {:?}",
                        self.name, param_name, action
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_operations(&self) -> Result<(), GatewayError> {
        let actions = self.enum_of("action");
        let resources = self.enum_of("resource_type");
        let Some(operations) = self.operations.as_ref() else {
            return Ok(());
        };
        for (key, operation_id) in operations {
            if operation_id.trim().is_empty() {
                return Err(GatewayError::configuration(format!(
                    "tool {:?}: operation key {:?} maps to an empty operationId",
                    self.name, key
                )));
            }
            let plain_action = actions.iter().any(|a| a == key);
            let compound = actions.iter().any(|action| {
                key.strip_prefix(action.as_str())
                    .and_then(|rest| rest.strip_prefix('_'))
                    .is_some_and(|resource| resources.iter().any(|r| r == resource))
            });
            if !plain_action && !compound {
                return Err(GatewayError::configuration(format!(
                    "tool {:?}: operation key {:?} matches neither an action nor \
                     an action_resource_type pair",
                    self.name, key
                )));
            }
        }
        Ok(())
    }

    fn validate_steps(&self) -> Result<(), GatewayError> {
        let Some(steps) = self.steps.as_ref() else {
            return Ok(());
        };
        let mut nodes = HashSet::new();
        for step in steps {
            step.parse_call().map_err(|_| {
                GatewayError::configuration(format!(
                    "tool {:?}: step call {:?} must look like \"METHOD /path\"",
                    self.name, step.call
                ))
            })?;
            if step.store_as.trim().is_empty() {
                return Err(GatewayError::configuration(format!(
                    "tool {:?}: step {:?} has an empty store_as",
                    self.name, step.call
                )));
            }
            if !nodes.insert(step.store_as.as_str()) {
                return Err(GatewayError::configuration(format!(
                    "tool {:?}: duplicate store_as {:?}",
                    self.name, step.store_as
                )));
            }
        }
        for step in steps {
            for dep in &step.depends_on {
                if !nodes.contains(dep.as_str()) {
                    return Err(GatewayError::configuration(format!(
                        "tool {:?}: step {:?} depends on unknown step {:?}",
                        self.name, step.store_as, dep
                    )));
                }
            }
        }
        // Kahn's algorithm over (store_as, depends_on); anything left over is
        // part of a cycle.
        let mut indegree: HashMap<&str, usize> = steps
            .iter()
            .map(|s| (s.store_as.as_str(), s.depends_on.len()))
            .collect();
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for step in steps {
                if step.depends_on.iter().any(|d| d == node) {
                    if let Some(d) = indegree.get_mut(step.store_as.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(step.store_as.as_str());
                        }
                    }
                }
            }
        }
        if visited != steps.len() {
            return Err(GatewayError::configuration(format!(
                "tool {:?}: steps contain a dependency cycle",
                self.name
            )));
        }
        Ok(())
    }
}
