//! OAuth proxy: plays the authorization server for the MCP client while an
//! external IdP does the real work. Keeps in-memory code and token tables;
//! codes are short-lived and single-use.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::errors::GatewayError;

/// Authorization codes are valid this long and exactly one exchange.
const CODE_TTL: Duration = Duration::from_secs(300);
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub introspection_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

impl OAuthConfig {
    /// Resolve `${env:NAME}` placeholders in every string field. A missing
    /// variable is a fatal startup error.
    pub fn resolve_env(mut self) -> Result<Self, GatewayError> {
        self.authorization_endpoint = substitute_env(&self.authorization_endpoint)?;
        self.token_endpoint = substitute_env(&self.token_endpoint)?;
        self.introspection_endpoint = self
            .introspection_endpoint
            .map(|s| substitute_env(&s))
            .transpose()?;
        self.revocation_endpoint = self
            .revocation_endpoint
            .map(|s| substitute_env(&s))
            .transpose()?;
        self.client_id = self.client_id.map(|s| substitute_env(&s)).transpose()?;
        self.client_secret = self.client_secret.map(|s| substitute_env(&s)).transpose()?;
        self.redirect_uri = self.redirect_uri.map(|s| substitute_env(&s)).transpose()?;
        Ok(self)
    }
}

fn substitute_env(value: &str) -> Result<String, GatewayError> {
    // Compiled per call; configuration resolution happens once at startup.
    let pattern = Regex::new(r"\$\{env:([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| GatewayError::configuration(format!("bad substitution pattern: {e}")))?;
    let mut result = String::new();
    let mut last = 0;
    for captures in pattern.captures_iter(value) {
        let whole = captures.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        let name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let resolved = std::env::var(name).map_err(|_| {
            GatewayError::configuration(format!(
                "OAuth config references ${{env:{name}}} but {name} is not set"
            ))
        })?;
        result.push_str(value.get(last..whole.0).unwrap_or_default());
        result.push_str(&resolved);
        last = whole.1;
    }
    result.push_str(value.get(last..).unwrap_or_default());
    Ok(result)
}

/// A registered MCP client, as presented by the transport layer.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_id: String,
    pub redirect_uris: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AuthorizeParams {
    pub redirect_uri: String,
    pub code_challenge: String,
    pub state: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub resource: Option<String>,
}

struct PendingAuthorization {
    client_id: String,
    params: AuthorizeParams,
    created_at: Instant,
}

struct TokenRecord {
    client_id: String,
    scopes: Vec<String>,
    expires_at: Instant,
    resource: Option<String>,
}

/// What the transport learns about a presented access token.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub expires_at: Instant,
}

/// Token endpoint response, passed through to the client unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEnvelope {
    pub access_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

pub struct OAuthProxy {
    config: OAuthConfig,
    http: reqwest::Client,
    codes: Mutex<HashMap<String, PendingAuthorization>>,
    tokens: Mutex<HashMap<String, TokenRecord>>,
}

impl OAuthProxy {
    /// Build the proxy, resolving env placeholders eagerly so a broken
    /// config fails startup instead of the first login.
    pub fn new(config: OAuthConfig) -> Result<Self, GatewayError> {
        let config = config.resolve_env()?;
        let http = reqwest::Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .map_err(|e| {
                GatewayError::configuration(format!("failed to build OAuth client: {e}"))
            })?;
        Ok(Self {
            config,
            http,
            codes: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Validate the client's redirect target, mint a local code, and build
    /// the redirect into the IdP's authorization endpoint.
    pub fn authorize(
        &self,
        client: &ClientInfo,
        params: AuthorizeParams,
    ) -> Result<(String, Url), GatewayError> {
        if !client.redirect_uris.iter().any(|u| u == &params.redirect_uri) {
            return Err(GatewayError::authorization(format!(
                "redirect_uri {:?} is not registered for client {:?}",
                params.redirect_uri, client.client_id
            )));
        }

        let mut redirect = Url::parse(&self.config.authorization_endpoint).map_err(|e| {
            GatewayError::configuration(format!("invalid authorization endpoint: {e}"))
        })?;
        let upstream_client_id = self
            .config
            .client_id
            .clone()
            .unwrap_or_else(|| client.client_id.clone());
        let scope = params
            .scopes
            .clone()
            .unwrap_or_else(|| self.config.scopes.clone())
            .join(" ");
        {
            let mut query = redirect.query_pairs_mut();
            query.append_pair("client_id", &upstream_client_id);
            query.append_pair("response_type", "code");
            query.append_pair("code_challenge", &params.code_challenge);
            query.append_pair("code_challenge_method", "S256");
            if let Some(state) = &params.state {
                query.append_pair("state", state);
            }
            if !scope.is_empty() {
                query.append_pair("scope", &scope);
            }
            query.append_pair("redirect_uri", &params.redirect_uri);
        }

        let code = Uuid::new_v4().simple().to_string();
        if let Ok(mut codes) = self.codes.lock() {
            codes.insert(
                code.clone(),
                PendingAuthorization {
                    client_id: client.client_id.clone(),
                    params,
                    created_at: Instant::now(),
                },
            );
        }
        Ok((code, redirect))
    }

    /// The stored PKCE challenge for a minted code.
    pub fn challenge_for_authorization_code(
        &self,
        client: &ClientInfo,
        code: &str,
    ) -> Result<String, GatewayError> {
        let codes = self
            .codes
            .lock()
            .map_err(|_| GatewayError::configuration("oauth code table lock poisoned"))?;
        let pending = codes
            .get(code)
            .ok_or_else(|| GatewayError::authentication("unknown authorization code"))?;
        if pending.client_id != client.client_id {
            return Err(GatewayError::authentication(
                "authorization code belongs to a different client",
            ));
        }
        Ok(pending.params.code_challenge.clone())
    }

    /// Exchange a local code for tokens at the IdP. The code is deleted
    /// before the network call: single-use even when the IdP errors.
    pub async fn exchange_authorization_code(
        &self,
        client: &ClientInfo,
        code: &str,
        verifier: Option<&str>,
        redirect_uri: Option<&str>,
    ) -> Result<TokenEnvelope, GatewayError> {
        let pending = {
            let mut codes = self
                .codes
                .lock()
                .map_err(|_| GatewayError::configuration("oauth code table lock poisoned"))?;
            let pending = codes
                .remove(code)
                .ok_or_else(|| GatewayError::authentication("unknown authorization code"))?;
            pending
        };
        if pending.client_id != client.client_id {
            return Err(GatewayError::authentication(
                "authorization code belongs to a different client",
            ));
        }
        if pending.created_at.elapsed() > CODE_TTL {
            return Err(GatewayError::authentication("authorization code expired"));
        }

        let redirect_uri = redirect_uri.unwrap_or(&pending.params.redirect_uri);
        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
        ];
        if let Some(verifier) = verifier {
            form.push(("code_verifier", verifier.to_string()));
        }
        self.push_client_credentials(&mut form);

        let envelope = self.post_token_request(&form).await?;
        self.remember_token(&envelope, &pending.client_id, pending.params.resource.clone());
        Ok(envelope)
    }

    /// `grant_type=refresh_token`, same shape as the code exchange.
    pub async fn exchange_refresh_token(
        &self,
        client: &ClientInfo,
        refresh_token: &str,
        scopes: Option<Vec<String>>,
    ) -> Result<TokenEnvelope, GatewayError> {
        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(scopes) = scopes {
            if !scopes.is_empty() {
                form.push(("scope", scopes.join(" ")));
            }
        }
        self.push_client_credentials(&mut form);

        let envelope = self.post_token_request(&form).await?;
        self.remember_token(&envelope, &client.client_id, None);
        Ok(envelope)
    }

    /// Validate an access token: cache first, then the IdP's introspection
    /// endpoint when configured.
    pub async fn verify_access_token(&self, token: &str) -> Result<VerifiedToken, GatewayError> {
        {
            let mut tokens = self
                .tokens
                .lock()
                .map_err(|_| GatewayError::configuration("oauth token table lock poisoned"))?;
            let now = Instant::now();
            tokens.retain(|_, record| record.expires_at > now);
            if let Some(record) = tokens.get(token) {
                return Ok(VerifiedToken {
                    client_id: record.client_id.clone(),
                    scopes: record.scopes.clone(),
                    expires_at: record.expires_at,
                });
            }
        }

        let Some(introspection) = &self.config.introspection_endpoint else {
            return Err(GatewayError::authentication("invalid access token"));
        };

        let mut form: Vec<(&str, String)> = vec![("token", token.to_string())];
        self.push_client_credentials(&mut form);
        let response = self
            .http
            .post(introspection)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                GatewayError::authentication(format!("token introspection failed: {e}"))
            })?;
        let introspected: IntrospectionResponse = response.json().await.map_err(|e| {
            GatewayError::authentication(format!("invalid introspection response: {e}"))
        })?;
        if !introspected.active {
            return Err(GatewayError::authentication("invalid access token"));
        }

        let expires_at = introspected
            .exp
            .and_then(|exp| {
                let now = chrono::Utc::now().timestamp();
                u64::try_from(exp - now).ok()
            })
            .map(|secs| Instant::now() + Duration::from_secs(secs))
            .unwrap_or_else(|| Instant::now() + DEFAULT_TOKEN_TTL);
        let verified = VerifiedToken {
            client_id: introspected.client_id.unwrap_or_default(),
            scopes: introspected
                .scope
                .map(|s| s.split(' ').map(str::to_string).collect())
                .unwrap_or_default(),
            expires_at,
        };

        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(
                token.to_string(),
                TokenRecord {
                    client_id: verified.client_id.clone(),
                    scopes: verified.scopes.clone(),
                    expires_at,
                    resource: None,
                },
            );
        }
        Ok(verified)
    }

    /// Drop the token locally and tell the IdP if it cares. Upstream
    /// failures are logged, never surfaced: revocation is best-effort.
    pub async fn revoke_token(&self, _client: &ClientInfo, token: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(token);
        }
        let Some(revocation) = &self.config.revocation_endpoint else {
            return;
        };
        let mut form: Vec<(&str, String)> = vec![("token", token.to_string())];
        self.push_client_credentials(&mut form);
        match self.http.post(revocation).form(&form).send().await {
            Ok(response) => {
                debug!(status = %response.status(), "token revocation forwarded");
            }
            Err(e) => {
                warn!("token revocation call failed: {e}");
            }
        }
    }

    pub fn cached_token_count(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn push_client_credentials(&self, form: &mut Vec<(&str, String)>) {
        if let Some(client_id) = &self.config.client_id {
            form.push(("client_id", client_id.clone()));
        }
        if let Some(client_secret) = &self.config.client_secret {
            form.push(("client_secret", client_secret.clone()));
        }
    }

    async fn post_token_request(
        &self,
        form: &[(&str, String)],
    ) -> Result<TokenEnvelope, GatewayError> {
        let response = self
            .http
            .post(&self.config.token_endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::authentication(format!("token exchange failed: {e}")))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(crate::upstream::classify_status(
                status,
                &text,
                &http::HeaderMap::new(),
            ));
        }
        serde_json::from_str(&text).map_err(|e| {
            GatewayError::authentication(format!("invalid token endpoint response: {e}"))
        })
    }

    fn remember_token(&self, envelope: &TokenEnvelope, client_id: &str, resource: Option<String>) {
        let ttl = envelope
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(
                envelope.access_token.clone(),
                TokenRecord {
                    client_id: client_id.to_string(),
                    scopes: envelope
                        .scope
                        .as_deref()
                        .map(|s| s.split(' ').map(str::to_string).collect())
                        .unwrap_or_default(),
                    expires_at: Instant::now() + ttl,
                    resource,
                },
            );
        }
    }
}
