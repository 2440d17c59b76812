//! Process configuration: defaults, optional YAML file, and the recognized
//! environment variables, merged in that order via figment. Also owns the
//! tracing subscriber setup.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use openapi_mcp_index::{ParameterLocation, SecurityScheme};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::errors::GatewayError;
use crate::profile::AuthSpec;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Silent,
}

impl LogLevel {
    fn directive(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Silent => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

/// Field names double as the lowercased environment variable names, so the
/// figment env provider maps `MCP_PORT` onto `mcp_port` and so on.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub openapi_spec_path: Option<PathBuf>,
    pub mcp_profile_path: Option<PathBuf>,
    pub mcp_transport: TransportKind,
    pub mcp_host: String,
    pub mcp_port: u16,
    pub session_timeout_ms: u64,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_ms: u64,
    pub metrics_enabled: bool,
    pub metrics_path: String,
    /// Comma-separated origin allow-list: exact origins, `*.domain`
    /// wildcards, and IPv4 CIDR blocks.
    pub allowed_origins: Option<String>,
    pub http_rate_limit_enabled: bool,
    pub http_rate_limit_window_ms: u64,
    pub http_rate_limit_max_requests: u64,
    pub http_rate_limit_metrics_max: u64,
    pub token_max_length: usize,
    pub max_body_bytes: usize,
    pub request_timeout_ms: u64,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    /// Default-profile auth override: force auth even when the document
    /// declares no security scheme.
    pub auth_force: bool,
    pub auth_type: Option<String>,
    pub auth_env_var: Option<String>,
    pub auth_query_param: Option<String>,
    pub auth_header_name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openapi_spec_path: None,
            mcp_profile_path: None,
            mcp_transport: TransportKind::default(),
            mcp_host: "127.0.0.1".to_string(),
            mcp_port: 3003,
            session_timeout_ms: 1_800_000,
            heartbeat_enabled: true,
            heartbeat_interval_ms: 30_000,
            metrics_enabled: false,
            metrics_path: "/metrics".to_string(),
            allowed_origins: None,
            http_rate_limit_enabled: false,
            http_rate_limit_window_ms: 60_000,
            http_rate_limit_max_requests: 120,
            http_rate_limit_metrics_max: 30,
            token_max_length: 1000,
            max_body_bytes: 4 * 1024 * 1024,
            request_timeout_ms: 30_000,
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            auth_force: false,
            auth_type: None,
            auth_env_var: None,
            auth_query_param: None,
            auth_header_name: None,
        }
    }
}

impl Config {
    /// Defaults <- optional YAML file <- environment.
    pub fn load(file: Option<&Path>) -> Result<Self, GatewayError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            figment = figment.merge(Yaml::file(file));
        }
        let config: Config = figment
            .merge(Env::raw())
            .extract()
            .map_err(|e| GatewayError::configuration(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.openapi_spec_path.is_none() {
            return Err(GatewayError::configuration(
                "OPENAPI_SPEC_PATH is required: point it at an OpenAPI 3.x document",
            ));
        }
        Ok(())
    }

    pub fn allowed_origin_entries(&self) -> Vec<String> {
        self.allowed_origins
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Auth spec for synthesized default profiles: the env override wins,
    /// then whatever the OpenAPI document's security scheme implies.
    pub fn default_auth_spec(&self, scheme: Option<SecurityScheme>) -> Option<AuthSpec> {
        let env_var = self
            .auth_env_var
            .clone()
            .unwrap_or_else(|| "API_TOKEN".to_string());

        if let Some(auth_type) = self.auth_type.as_deref() {
            return match auth_type {
                "bearer" => Some(AuthSpec::Bearer {
                    value_from_env: env_var,
                    priority: 0,
                    validation_endpoint: None,
                    validation_timeout_ms: None,
                }),
                "query" => Some(AuthSpec::Query {
                    value_from_env: env_var,
                    query_param: self
                        .auth_query_param
                        .clone()
                        .unwrap_or_else(|| "token".to_string()),
                    priority: 0,
                    validation_endpoint: None,
                    validation_timeout_ms: None,
                }),
                "custom-header" => Some(AuthSpec::CustomHeader {
                    value_from_env: env_var,
                    header_name: self
                        .auth_header_name
                        .clone()
                        .unwrap_or_else(|| "X-API-Token".to_string()),
                    priority: 0,
                    validation_endpoint: None,
                    validation_timeout_ms: None,
                }),
                other => {
                    tracing::warn!(auth_type = other, "unrecognized AUTH_TYPE, ignoring");
                    None
                }
            };
        }

        match scheme {
            Some(SecurityScheme::Bearer) => Some(AuthSpec::Bearer {
                value_from_env: env_var,
                priority: 0,
                validation_endpoint: None,
                validation_timeout_ms: None,
            }),
            Some(SecurityScheme::ApiKey { name, location }) => match location {
                ParameterLocation::Query => Some(AuthSpec::Query {
                    value_from_env: env_var,
                    query_param: name,
                    priority: 0,
                    validation_endpoint: None,
                    validation_timeout_ms: None,
                }),
                _ => Some(AuthSpec::CustomHeader {
                    value_from_env: env_var,
                    header_name: name,
                    priority: 0,
                    validation_endpoint: None,
                    validation_timeout_ms: None,
                }),
            },
            None if self.auth_force => Some(AuthSpec::Bearer {
                value_from_env: env_var,
                priority: 0,
                validation_endpoint: None,
                validation_timeout_ms: None,
            }),
            None => None,
        }
    }
}

/// Install the global tracing subscriber per `LOG_LEVEL`/`LOG_FORMAT`.
/// `RUST_LOG` still wins when set, figment-style layering for logs.
pub fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.directive()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Console => builder.compact().try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber was already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.mcp_transport, TransportKind::Stdio);
        assert_eq!(config.mcp_host, "127.0.0.1");
        assert_eq!(config.mcp_port, 3003);
        assert_eq!(config.session_timeout_ms, 1_800_000);
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.metrics_path, "/metrics");
        assert_eq!(config.token_max_length, 1000);
    }

    #[test]
    fn env_layering_and_required_spec_path() {
        figment::Jail::expect_with(|jail| {
            // Without the document path the load is a fatal config error.
            let err = Config::load(None).expect_err("must fail");
            assert!(err.to_string().contains("OPENAPI_SPEC_PATH"));

            jail.set_env("OPENAPI_SPEC_PATH", "/tmp/spec.json");
            jail.set_env("MCP_TRANSPORT", "http");
            jail.set_env("MCP_PORT", "4010");
            jail.set_env("LOG_LEVEL", "DEBUG");
            jail.set_env("LOG_FORMAT", "json");
            jail.set_env("ALLOWED_ORIGINS", "https://a.example.com, *.example.org");

            let config = Config::load(None).expect("config loads");
            assert_eq!(config.mcp_transport, TransportKind::Http);
            assert_eq!(config.mcp_port, 4010);
            assert_eq!(config.log_level, LogLevel::Debug);
            assert_eq!(config.log_format, LogFormat::Json);
            assert_eq!(
                config.allowed_origin_entries(),
                vec!["https://a.example.com".to_string(), "*.example.org".to_string()]
            );
            Ok(())
        });
    }

    #[test]
    fn auth_type_override_beats_document_scheme() {
        let config = Config {
            auth_type: Some("custom-header".to_string()),
            auth_header_name: Some("PRIVATE-TOKEN".to_string()),
            auth_env_var: Some("GITLAB_TOKEN".to_string()),
            ..Config::default()
        };
        let spec = config.default_auth_spec(Some(SecurityScheme::Bearer)).unwrap();
        match spec {
            AuthSpec::CustomHeader {
                value_from_env,
                header_name,
                ..
            } => {
                assert_eq!(value_from_env, "GITLAB_TOKEN");
                assert_eq!(header_name, "PRIVATE-TOKEN");
            }
            other => panic!("expected custom header spec, got {other:?}"),
        }
    }

    #[test]
    fn document_scheme_drives_default_auth() {
        let config = Config::default();
        assert!(config.default_auth_spec(None).is_none());
        assert!(matches!(
            config.default_auth_spec(Some(SecurityScheme::Bearer)),
            Some(AuthSpec::Bearer { .. })
        ));
        let api_key = config.default_auth_spec(Some(SecurityScheme::ApiKey {
            name: "PRIVATE-TOKEN".to_string(),
            location: ParameterLocation::Header,
        }));
        assert!(matches!(api_key, Some(AuthSpec::CustomHeader { .. })));
    }

    #[test]
    fn auth_force_defaults_to_bearer() {
        let config = Config {
            auth_force: true,
            ..Config::default()
        };
        assert!(matches!(
            config.default_auth_spec(None),
            Some(AuthSpec::Bearer { .. })
        ));
    }
}
