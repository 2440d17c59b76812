//! The streaming HTTP transport: one endpoint multiplexing POST/GET/DELETE
//! for the MCP protocol, plus health, optional metrics, and the OAuth proxy
//! routes. Session and origin rules follow the transport security policy.

pub mod security;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Form, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::errors::GatewayError;
use crate::health::HealthStatus;
use crate::metrics;
use crate::oauth::{AuthorizeParams, ClientInfo, OAuthProxy};
use crate::session::{SessionStore, SseEvent};
use security::{OriginRule, RequestRateLimiter, extract_client_token, origin_allowed};

pub const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
pub struct HttpTransportConfig {
    pub host: String,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval: Duration,
    pub metrics_enabled: bool,
    pub metrics_path: String,
    pub health_path: String,
    pub max_body_bytes: usize,
    pub token_max_length: usize,
}

pub struct TransportState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: HttpTransportConfig,
    pub origin_rules: Vec<OriginRule>,
    pub limiter: Option<RequestRateLimiter>,
    pub metrics_limiter: Option<RequestRateLimiter>,
    pub oauth: Option<Arc<OAuthProxy>>,
    pub token_validator: Option<security::TokenValidator>,
}

impl TransportState {
    fn sessions(&self) -> &Arc<SessionStore> {
        self.dispatcher.sessions()
    }
}

/// Assemble the axum router over the transport state.
pub fn build_router(state: Arc<TransportState>) -> Router {
    if !is_loopback(&state.config.host) && state.origin_rules.is_empty() {
        warn!(
            host = %state.config.host,
            "server is bound to a non-loopback address without ALLOWED_ORIGINS; \
             cross-origin browser requests will only be accepted from the bound host"
        );
    }

    let mut router = Router::new()
        .route(
            "/mcp",
            post(handle_post).get(handle_get).delete(handle_delete),
        )
        .route(&state.config.health_path, get(handle_health));

    if state.config.metrics_enabled {
        router = router.route(&state.config.metrics_path, get(handle_metrics));
    }
    if state.oauth.is_some() {
        router = router
            .route("/authorize", get(handle_oauth_authorize))
            .route("/token", post(handle_oauth_token))
            .route("/revoke", post(handle_oauth_revoke));
    }

    let mut router = router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security_middleware,
        ))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(TraceLayer::new_for_http());
    if let Some(cors) = cors_layer(&state.origin_rules) {
        router = router.layer(cors);
    }
    router.with_state(state)
}

/// Browser CORS headers for the exact entries of the allow-list. The hard
/// origin check in the security middleware still applies; this only makes
/// the allowed origins usable from a browser.
fn cors_layer(rules: &[OriginRule]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = rules
        .iter()
        .filter_map(|rule| match rule {
            OriginRule::Exact(origin) if origin.contains("://") => origin.parse().ok(),
            _ => None,
        })
        .collect();
    if origins.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                HeaderName::from_static("mcp-session-id"),
                HeaderName::from_static("x-api-token"),
                HeaderName::from_static("last-event-id"),
            ]),
    )
}

fn is_loopback(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

/// `{error, message}` error body with the right status code.
struct HttpError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl HttpError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.error, "message": self.message })),
        )
            .into_response()
    }
}

/// Origin allow-listing, per-IP rate limiting, request accounting.
async fn security_middleware(
    State(state): State<Arc<TransportState>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    // Origin is decided before any rate accounting: a disallowed origin is
    // 403 even when the address is over its budget.
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if !origin_allowed(origin, &state.config.host, &state.origin_rules) {
        debug!(origin = origin.unwrap_or("-"), "rejected cross-origin request");
        let response = HttpError::new(
            StatusCode::FORBIDDEN,
            "origin_forbidden",
            "Origin is not allowed by this server",
        )
        .into_response();
        metrics::record_request(&method, response.status().as_u16());
        return response;
    }

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    if let Some(ip) = client_ip {
        let limiter = if path == state.config.metrics_path {
            state.metrics_limiter.as_ref()
        } else {
            state.limiter.as_ref()
        };
        if let Some(limiter) = limiter {
            if !limiter.try_acquire(ip) {
                let response = HttpError::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    "too many requests from this address",
                )
                .into_response();
                metrics::record_request(&method, response.status().as_u16());
                return response;
            }
        }
    }

    let response = next.run(request).await;
    metrics::record_request(&method, response.status().as_u16());
    response
}

fn accept_contains(headers: &HeaderMap, mime: &str) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| {
            accept
                .split(',')
                .map(|part| part.split(';').next().unwrap_or("").trim())
                .any(|part| part == mime || part == "*/*")
        })
        .unwrap_or(false)
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn is_request(message: &Value) -> bool {
    message.get("method").is_some()
        && message.get("id").map(|id| !id.is_null()).unwrap_or(false)
}

async fn handle_post(
    State(state): State<Arc<TransportState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    match post_inner(&state, &headers, &body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn post_inner(
    state: &Arc<TransportState>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, HttpError> {
    let accepts_json = accept_contains(headers, "application/json");
    let accepts_sse = accept_contains(headers, "text/event-stream");
    if !accepts_json && !accepts_sse {
        return Err(HttpError::new(
            StatusCode::NOT_ACCEPTABLE,
            "not_acceptable",
            "Accept must include application/json or text/event-stream",
        ));
    }

    let parsed: Value = serde_json::from_slice(body).map_err(|e| {
        HttpError::new(
            StatusCode::BAD_REQUEST,
            "parse_error",
            format!("invalid JSON-RPC body: {e}"),
        )
    })?;
    let (messages, batched) = match parsed {
        Value::Array(items) if !items.is_empty() => (items, true),
        Value::Array(_) => {
            return Err(HttpError::new(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "empty batch",
            ));
        }
        single => (vec![single], false),
    };

    let has_request = messages.iter().any(is_request);
    if !has_request {
        // Notifications and responses are accepted and processed off the
        // request's critical path.
        if let Some(session_id) = session_header(headers) {
            state.sessions().refresh(&session_id);
        }
        let dispatcher = state.dispatcher.clone();
        tokio::spawn(async move {
            for message in messages {
                dispatcher.handle_message(&message, None).await;
            }
        });
        return Ok(StatusCode::ACCEPTED.into_response());
    }

    let token = extract_client_token(headers, state.config.token_max_length)
        .map_err(|e| HttpError::new(StatusCode::UNAUTHORIZED, "invalid_token", e.to_string()))?;
    if let Some(token) = &token {
        use secrecy::ExposeSecret;
        if let Some(oauth) = &state.oauth {
            oauth
                .verify_access_token(token.expose_secret())
                .await
                .map_err(|e| {
                    HttpError::new(StatusCode::UNAUTHORIZED, "invalid_token", e.to_string())
                })?;
        } else if let Some(validator) = &state.token_validator {
            validator
                .validate(token.expose_secret())
                .await
                .map_err(|e| {
                    HttpError::new(StatusCode::UNAUTHORIZED, "invalid_token", e.to_string())
                })?;
        }
    }

    let is_initialize = messages
        .iter()
        .any(|m| m.get("method").and_then(Value::as_str) == Some("initialize"));
    let (session_id, created) = if is_initialize {
        (state.sessions().create(token), true)
    } else {
        let session_id = session_header(headers).ok_or_else(|| {
            HttpError::new(
                StatusCode::BAD_REQUEST,
                "missing_session",
                "Mcp-Session-Id header is required",
            )
        })?;
        if !state.sessions().refresh(&session_id) {
            return Err(HttpError::new(
                StatusCode::NOT_FOUND,
                "unknown_session",
                "session does not exist or has expired",
            ));
        }
        (session_id, false)
    };
    metrics::set_active_sessions(state.sessions().count());

    let mut replies = Vec::new();
    for message in &messages {
        if let Some(reply) = state
            .dispatcher
            .handle_message(message, Some(&session_id))
            .await
        {
            replies.push(reply);
        }
    }

    let payload = if batched {
        Value::Array(replies)
    } else {
        replies.into_iter().next().unwrap_or(Value::Null)
    };

    let mut response = if accepts_json {
        Json(payload).into_response()
    } else {
        sse_single_event(&payload)
    };
    if created {
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
    }
    Ok(response)
}

/// A one-shot SSE body carrying a single event, then closing.
fn sse_single_event(payload: &Value) -> Response {
    let body = format!("data: {payload}\n\n");
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        body,
    )
        .into_response()
}

struct StreamGuard {
    sessions: Arc<SessionStore>,
    session_id: String,
    stream_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        // The client went away; the session and the replay buffer survive.
        self.sessions.close_stream(&self.session_id, &self.stream_id);
    }
}

async fn handle_get(
    State(state): State<Arc<TransportState>>,
    headers: HeaderMap,
) -> Response {
    if !accept_contains(&headers, "text/event-stream") {
        return HttpError::new(
            StatusCode::NOT_ACCEPTABLE,
            "not_acceptable",
            "Accept must include text/event-stream",
        )
        .into_response();
    }
    let Some(session_id) = session_header(&headers) else {
        return HttpError::new(
            StatusCode::BAD_REQUEST,
            "missing_session",
            "Mcp-Session-Id header is required",
        )
        .into_response();
    };
    if !state.sessions().refresh(&session_id) {
        return HttpError::new(
            StatusCode::NOT_FOUND,
            "unknown_session",
            "session does not exist or has expired",
        )
        .into_response();
    }

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let sessions = state.sessions().clone();
    let opened = match last_event_id {
        Some(cursor) => sessions
            .resume_stream(&session_id, cursor)
            .or_else(|_| {
                sessions
                    .open_stream(&session_id)
                    .map(|(id, rx)| (id, Vec::new(), rx))
            }),
        None => sessions
            .open_stream(&session_id)
            .map(|(id, rx)| (id, Vec::new(), rx)),
    };
    let (stream_id, replayed, receiver) = match opened {
        Ok(opened) => opened,
        Err(err) => {
            return HttpError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "stream_error",
                err.to_string(),
            )
            .into_response();
        }
    };
    debug!(session_id = %session_id, stream_id = %stream_id, replayed = replayed.len(), "stream opened");

    let guard = StreamGuard {
        sessions,
        session_id,
        stream_id,
    };
    let stream = futures::stream::iter(replayed)
        .chain(UnboundedReceiverStream::new(receiver))
        .map(move |event: SseEvent| {
            let _hold_until_disconnect = &guard;
            Ok::<_, Infallible>(Event::default().id(event.id.to_string()).data(event.data))
        });

    let sse = Sse::new(stream);
    if state.config.heartbeat_enabled {
        sse.keep_alive(
            KeepAlive::new()
                .interval(state.config.heartbeat_interval)
                .text("ping"),
        )
        .into_response()
    } else {
        sse.into_response()
    }
}

async fn handle_delete(
    State(state): State<Arc<TransportState>>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return HttpError::new(
            StatusCode::BAD_REQUEST,
            "missing_session",
            "Mcp-Session-Id header is required",
        )
        .into_response();
    };
    let destroyed = state.sessions().destroy(&session_id);
    metrics::set_active_sessions(state.sessions().count());
    if destroyed {
        StatusCode::NO_CONTENT.into_response()
    } else {
        HttpError::new(
            StatusCode::NOT_FOUND,
            "unknown_session",
            "session does not exist or has expired",
        )
        .into_response()
    }
}

async fn handle_health(State(state): State<Arc<TransportState>>) -> Json<HealthStatus> {
    let sessions = state.sessions().count();
    metrics::set_active_sessions(sessions);
    Json(HealthStatus::ok(sessions))
}

async fn handle_metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::encode(),
    )
        .into_response()
}

// ---- OAuth proxy routes -----------------------------------------------

#[derive(Debug, serde::Deserialize)]
struct AuthorizeQuery {
    client_id: String,
    redirect_uri: String,
    code_challenge: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    resource: Option<String>,
}

async fn handle_oauth_authorize(
    State(state): State<Arc<TransportState>>,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    let Some(oauth) = &state.oauth else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let client = ClientInfo {
        client_id: query.client_id,
        redirect_uris: vec![query.redirect_uri.clone()],
    };
    let params = AuthorizeParams {
        redirect_uri: query.redirect_uri,
        code_challenge: query.code_challenge,
        state: query.state,
        scopes: query
            .scope
            .map(|s| s.split(' ').map(str::to_string).collect()),
        resource: query.resource,
    };
    match oauth.authorize(&client, params) {
        Ok((_code, redirect)) => Redirect::temporary(redirect.as_str()).into_response(),
        Err(err) => oauth_error(err),
    }
}

#[derive(Debug, serde::Deserialize)]
struct TokenForm {
    grant_type: String,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

async fn handle_oauth_token(
    State(state): State<Arc<TransportState>>,
    Form(form): Form<TokenForm>,
) -> Response {
    let Some(oauth) = &state.oauth else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let client = ClientInfo {
        client_id: form.client_id.unwrap_or_default(),
        redirect_uris: Vec::new(),
    };
    let result = match form.grant_type.as_str() {
        "authorization_code" => match form.code {
            Some(code) => {
                oauth
                    .exchange_authorization_code(
                        &client,
                        &code,
                        form.code_verifier.as_deref(),
                        form.redirect_uri.as_deref(),
                    )
                    .await
            }
            None => Err(GatewayError::validation("code is required")),
        },
        "refresh_token" => match form.refresh_token {
            Some(refresh_token) => {
                let scopes = form
                    .scope
                    .map(|s| s.split(' ').map(str::to_string).collect());
                oauth
                    .exchange_refresh_token(&client, &refresh_token, scopes)
                    .await
            }
            None => Err(GatewayError::validation("refresh_token is required")),
        },
        other => Err(GatewayError::validation(format!(
            "unsupported grant_type {other:?}"
        ))),
    };
    match result {
        Ok(envelope) => Json(envelope).into_response(),
        Err(err) => oauth_error(err),
    }
}

#[derive(Debug, serde::Deserialize)]
struct RevokeForm {
    token: String,
    #[serde(default)]
    client_id: Option<String>,
}

async fn handle_oauth_revoke(
    State(state): State<Arc<TransportState>>,
    Form(form): Form<RevokeForm>,
) -> Response {
    let Some(oauth) = &state.oauth else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let client = ClientInfo {
        client_id: form.client_id.unwrap_or_default(),
        redirect_uris: Vec::new(),
    };
    oauth.revoke_token(&client, &form.token).await;
    StatusCode::OK.into_response()
}

fn oauth_error(err: GatewayError) -> Response {
    let status = match &err {
        GatewayError::Authentication { .. } => StatusCode::UNAUTHORIZED,
        GatewayError::Authorization { .. } => StatusCode::FORBIDDEN,
        GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    HttpError::new(status, "oauth_error", err.to_string()).into_response()
}
