//! Builds every runtime component from the configuration, then hands off to
//! the selected transport. Everything fallible here is a fatal startup
//! error; clients never see a half-initialized gateway.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use openapi_mcp_index::OperationIndex;
use rmcp::ServiceExt as _;
use rmcp::transport::stdio;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use super::{Running, shutdown_signal};
use crate::client_factory::HttpClientFactory;
use crate::dispatcher::Dispatcher;
use crate::errors::GatewayError;
use crate::metrics;
use crate::oauth::OAuthProxy;
use crate::profile::{AuthConfig, InterceptorConfig, Profile};
use crate::request::RequestBuilder;
use crate::runtime::{Config, TransportKind};
use crate::sanitize::Sanitizer;
use crate::server::Server;
use crate::session::SessionStore;
use crate::tools::ToolRegistry;
use crate::transport::security::{RequestRateLimiter, TokenValidator, parse_origin_rules};
use crate::transport::{HttpTransportConfig, TransportState, build_router};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub(super) struct Starting {
    config: Config,
    interceptors: InterceptorConfig,
    dispatcher: Arc<Dispatcher>,
    factory: Arc<HttpClientFactory>,
    sessions: Arc<SessionStore>,
    oauth: Option<Arc<OAuthProxy>>,
}

impl Starting {
    pub(super) fn prepare(server: Server) -> Result<Self, GatewayError> {
        let Server { config, namer } = server;

        let spec_path = config.openapi_spec_path.as_ref().ok_or_else(|| {
            GatewayError::configuration("OPENAPI_SPEC_PATH is required")
        })?;
        let index = OperationIndex::from_path(spec_path)
            .map_err(|e| GatewayError::configuration(e.to_string()))?;
        info!(
            operations = index.len(),
            document = %spec_path.display(),
            "OpenAPI document indexed"
        );

        let (registry, interceptors) = match &config.mcp_profile_path {
            Some(path) => {
                let profile = Profile::load(path)?;
                info!(profile = %profile.profile_name, tools = profile.tools.len(), "profile loaded");
                let interceptors = profile.interceptors.clone();
                (ToolRegistry::from_profile(&profile), interceptors)
            }
            None => {
                let registry = ToolRegistry::synthesize(&index, namer.as_ref());
                info!(tools = registry.len(), "no profile supplied, synthesized one tool per operation");
                let mut interceptors = InterceptorConfig::default();
                interceptors.auth = config
                    .default_auth_spec(index.security_scheme())
                    .map(AuthConfig::One);
                (registry, interceptors)
            }
        };
        if registry.is_empty() {
            return Err(GatewayError::configuration(
                "no tools to serve: the document has no operations and no profile was given",
            ));
        }

        let base_url = resolve_base_url(&interceptors, &index)?;
        info!(base_url = %base_url, "upstream base URL resolved");

        let sanitizer = Sanitizer::new(configured_secrets(&interceptors));
        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let factory = Arc::new(HttpClientFactory::new(
            interceptors.clone(),
            request_timeout,
            sanitizer,
        ));

        let sessions = Arc::new(SessionStore::new(Duration::from_millis(
            config.session_timeout_ms,
        )));
        {
            let factory = factory.clone();
            sessions.on_destroy(move |session_id| factory.destroy(session_id));
        }

        let oauth = interceptors
            .auth
            .as_ref()
            .and_then(|auth| auth.oauth())
            .cloned()
            .map(OAuthProxy::new)
            .transpose()?
            .map(Arc::new);

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(registry),
            Arc::new(index),
            RequestBuilder::new(base_url),
            factory.clone(),
            sessions.clone(),
        ));

        Ok(Self {
            config,
            interceptors,
            dispatcher,
            factory,
            sessions,
            oauth,
        })
    }

    pub(super) async fn serve(self) -> Result<(), GatewayError> {
        match self.config.mcp_transport {
            TransportKind::Stdio => self.serve_stdio().await,
            TransportKind::Http => self.serve_http().await,
        }
    }

    /// Stdio deployments share one identity: the env-credential client.
    async fn serve_stdio(self) -> Result<(), GatewayError> {
        self.factory.create_global()?;
        info!("starting MCP server on stdio");

        let running = Running {
            dispatcher: self.dispatcher.clone(),
        };
        let service = running
            .serve(stdio())
            .await
            .inspect_err(|e| error!("serving error: {e:?}"))
            .map_err(|e| GatewayError::configuration(format!("stdio transport failed: {e}")))?;
        service
            .waiting()
            .await
            .map_err(|e| GatewayError::configuration(format!("stdio transport failed: {e}")))?;
        Ok(())
    }

    async fn serve_http(self) -> Result<(), GatewayError> {
        let address = SocketAddr::new(parse_host(&self.config.mcp_host)?, self.config.mcp_port);

        let limiter = self.config.http_rate_limit_enabled.then(|| {
            RequestRateLimiter::new(
                self.config.http_rate_limit_max_requests,
                Duration::from_millis(self.config.http_rate_limit_window_ms),
            )
        });
        let metrics_limiter = self.config.http_rate_limit_enabled.then(|| {
            RequestRateLimiter::new(
                self.config.http_rate_limit_metrics_max,
                Duration::from_millis(self.config.http_rate_limit_window_ms),
            )
        });

        let state = Arc::new(TransportState {
            dispatcher: self.dispatcher.clone(),
            config: HttpTransportConfig {
                host: self.config.mcp_host.clone(),
                heartbeat_enabled: self.config.heartbeat_enabled,
                heartbeat_interval: Duration::from_millis(self.config.heartbeat_interval_ms),
                metrics_enabled: self.config.metrics_enabled,
                metrics_path: self.config.metrics_path.clone(),
                health_path: "/health".to_string(),
                max_body_bytes: self.config.max_body_bytes,
                token_max_length: self.config.token_max_length,
            },
            origin_rules: parse_origin_rules(&self.config.allowed_origin_entries()),
            limiter,
            metrics_limiter,
            oauth: self.oauth.clone(),
            token_validator: self
                .interceptors
                .auth
                .as_ref()
                .and_then(TokenValidator::from_auth),
        });
        let router = build_router(state);

        let cancellation = CancellationToken::new();
        let sweeper = {
            let sessions = self.sessions.clone();
            let token = cancellation.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            sessions.sweep(tokio::time::Instant::now());
                            metrics::set_active_sessions(sessions.count());
                        }
                    }
                }
            })
        };

        let listener = tokio::net::TcpListener::bind(address).await.map_err(|e| {
            GatewayError::configuration(format!("failed to bind {address}: {e}"))
        })?;
        info!(%address, "starting MCP server on streamable HTTP");

        let served = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        cancellation.cancel();
        sweeper.abort();
        let destroyed = self.sessions.destroy_all();
        info!(destroyed, "sessions destroyed on shutdown");

        served.map_err(|e| GatewayError::configuration(format!("server error: {e}")))
    }
}

fn parse_host(host: &str) -> Result<IpAddr, GatewayError> {
    if host == "localhost" {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    host.parse::<IpAddr>()
        .map_err(|_| GatewayError::configuration(format!("invalid MCP_HOST {host:?}")))
}

/// Base URL priority: profile env var, profile default, then the document's
/// own `servers` entry.
fn resolve_base_url(
    interceptors: &InterceptorConfig,
    index: &OperationIndex,
) -> Result<Url, GatewayError> {
    let configured = interceptors.base_url.as_ref().and_then(|base| {
        base.env_var
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
            .or_else(|| base.default.clone())
    });
    let raw = configured
        .or_else(|| index.base_url())
        .ok_or_else(|| {
            GatewayError::configuration(
                "no upstream base URL: configure interceptors.base_url or add a servers \
                 entry to the OpenAPI document",
            )
        })?;
    Url::parse(&raw)
        .map_err(|e| GatewayError::configuration(format!("invalid base URL {raw:?}: {e}")))
}

/// Every env-sourced credential value, for log redaction.
fn configured_secrets(interceptors: &InterceptorConfig) -> Vec<String> {
    let Some(auth) = &interceptors.auth else {
        return Vec::new();
    };
    auth.specs()
        .into_iter()
        .filter_map(|spec| spec.value_from_env())
        .filter_map(|var| std::env::var(var).ok())
        .filter(|value| !value.is_empty())
        .collect()
}
