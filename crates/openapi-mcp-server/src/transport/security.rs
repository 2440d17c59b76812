//! Transport-side security checks: origin/CIDR allow-listing, strict client
//! token extraction, and per-IP request rate limiting.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use http::HeaderMap;
use regex::Regex;
use secrecy::SecretString;
use tokio::time::Instant;
use tracing::warn;
use url::Url;

use crate::errors::GatewayError;

/// Shape every client token must satisfy, applied before anything else sees
/// the value.
static TOKEN_SHAPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-._~+/]+=*$").ok());

/// One parsed allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginRule {
    Exact(String),
    /// `*.example.com` matches any subdomain (and the apex).
    WildcardDomain(String),
    /// IPv4 network in CIDR notation.
    Cidr { network: u32, prefix: u8 },
}

/// Parse allow-list entries. Invalid CIDR entries are logged and skipped;
/// startup continues.
pub fn parse_origin_rules(entries: &[String]) -> Vec<OriginRule> {
    let mut rules = Vec::new();
    for entry in entries {
        if let Some(domain) = entry.strip_prefix("*.") {
            rules.push(OriginRule::WildcardDomain(domain.to_ascii_lowercase()));
        } else if entry.contains('/') && !entry.contains("://") {
            match parse_cidr(entry) {
                Some((network, prefix)) => rules.push(OriginRule::Cidr { network, prefix }),
                None => {
                    warn!(entry = %entry, "ignoring invalid CIDR allow-list entry");
                }
            }
        } else {
            rules.push(OriginRule::Exact(entry.to_ascii_lowercase()));
        }
    }
    rules
}

fn parse_cidr(entry: &str) -> Option<(u32, u8)> {
    let (addr, prefix) = entry.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    Some((u32::from(addr), prefix))
}

fn in_cidr(ip: Ipv4Addr, network: u32, prefix: u8) -> bool {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    };
    (u32::from(ip) & mask) == (network & mask)
}

fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// The spec'd origin decision: loopback deployments and absent Origin
/// headers pass; everything else must match the bound host or the
/// allow-list.
pub fn origin_allowed(
    origin: Option<&str>,
    bound_host: &str,
    rules: &[OriginRule],
) -> bool {
    if is_loopback_host(bound_host) {
        return true;
    }
    let Some(origin) = origin else {
        // Non-browser clients don't send Origin; CSRF is a browser concern.
        return true;
    };
    let Ok(url) = Url::parse(origin) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();

    if is_loopback_host(&host) || host == bound_host.to_ascii_lowercase() {
        return true;
    }
    for rule in rules {
        match rule {
            OriginRule::Exact(allowed) => {
                // Entries may be bare hosts or full origins.
                if &host == allowed || origin.to_ascii_lowercase() == *allowed {
                    return true;
                }
            }
            OriginRule::WildcardDomain(domain) => {
                if host == *domain || host.ends_with(&format!(".{domain}")) {
                    return true;
                }
            }
            OriginRule::Cidr { network, prefix } => {
                if let Ok(ip) = host.parse::<Ipv4Addr>() {
                    if in_cidr(ip, *network, *prefix) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

/// Validate a raw token value: bounded length, strict shape.
pub fn validate_token_value(token: &str, max_length: usize) -> Result<(), GatewayError> {
    if token.is_empty() {
        return Err(GatewayError::authentication("empty API token"));
    }
    if token.len() > max_length {
        return Err(GatewayError::authentication(format!(
            "API token exceeds the maximum length of {max_length} bytes"
        )));
    }
    let shape_ok = TOKEN_SHAPE
        .as_ref()
        .map(|re| re.is_match(token))
        .unwrap_or(false);
    if !shape_ok {
        return Err(GatewayError::authentication(
            "API token contains characters outside the allowed alphabet",
        ));
    }
    Ok(())
}

/// Pull the client token from `Authorization: Bearer` or `X-API-Token`.
/// Present-but-malformed is an error; absent is fine.
pub fn extract_client_token(
    headers: &HeaderMap,
    max_length: usize,
) -> Result<Option<SecretString>, GatewayError> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| GatewayError::authentication("malformed Authorization header"))?;
        let token = value.strip_prefix("Bearer ").ok_or_else(|| {
            GatewayError::authentication("Authorization header must use the Bearer scheme")
        })?;
        validate_token_value(token, max_length)?;
        return Ok(Some(SecretString::from(token.to_string())));
    }
    if let Some(value) = headers.get("x-api-token") {
        let token = value
            .to_str()
            .map_err(|_| GatewayError::authentication("malformed X-API-Token header"))?;
        validate_token_value(token, max_length)?;
        return Ok(Some(SecretString::from(token.to_string())));
    }
    Ok(None)
}

/// Networked validation of client tokens against a configured endpoint,
/// bounded by the spec's validation timeout. Used for non-OAuth auth specs;
/// OAuth tokens go through the proxy's introspection path instead.
pub struct TokenValidator {
    client: reqwest::Client,
    endpoint: Url,
}

impl TokenValidator {
    /// Build from the primary auth spec, if it declares a validation
    /// endpoint.
    pub fn from_auth(auth: &crate::profile::AuthConfig) -> Option<Self> {
        let spec = auth.primary()?;
        let (endpoint, timeout_ms) = match spec {
            crate::profile::AuthSpec::Bearer {
                validation_endpoint,
                validation_timeout_ms,
                ..
            }
            | crate::profile::AuthSpec::Query {
                validation_endpoint,
                validation_timeout_ms,
                ..
            }
            | crate::profile::AuthSpec::CustomHeader {
                validation_endpoint,
                validation_timeout_ms,
                ..
            } => (validation_endpoint.clone()?, validation_timeout_ms.unwrap_or(5000)),
            crate::profile::AuthSpec::Oauth { .. } => return None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .ok()?;
        Some(Self { client, endpoint })
    }

    /// A token is valid when the endpoint answers 2xx to an authenticated
    /// probe within the timeout.
    pub async fn validate(&self, token: &str) -> Result<(), GatewayError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                GatewayError::authentication(format!("token validation call failed: {e}"))
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::authentication("token validation rejected the token"))
        }
    }
}

/// Per-IP token bucket over a fixed window, for the transport endpoints.
pub struct RequestRateLimiter {
    buckets: Mutex<HashMap<IpAddr, (f64, Instant)>>,
    max_tokens: f64,
    window: Duration,
}

impl RequestRateLimiter {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_tokens: max_requests.max(1) as f64,
            window,
        }
    }

    /// Consume one token for `ip`; false means rate-limited.
    pub fn try_acquire(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let Ok(mut buckets) = self.buckets.lock() else {
            return true;
        };
        let (tokens, last_refill) = buckets.entry(ip).or_insert((self.max_tokens, now));
        let refill = now.duration_since(*last_refill).as_secs_f64()
            / self.window.as_secs_f64()
            * self.max_tokens;
        *tokens = (*tokens + refill).min(self.max_tokens);
        *last_refill = now;
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn rules(entries: &[&str]) -> Vec<OriginRule> {
        parse_origin_rules(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn loopback_binding_allows_everything() {
        assert!(origin_allowed(Some("https://evil.example.com"), "127.0.0.1", &[]));
        assert!(origin_allowed(None, "localhost", &[]));
    }

    #[rstest]
    #[case(Some("http://localhost:3000"), true)]
    #[case(Some("http://127.0.0.1:8080"), true)]
    #[case(Some("https://gw.example.com"), true)] // equals bound host
    #[case(Some("https://app.example.com"), false)]
    #[case(None, true)]
    fn non_loopback_binding_without_allowlist(
        #[case] origin: Option<&str>,
        #[case] allowed: bool,
    ) {
        assert_eq!(origin_allowed(origin, "gw.example.com", &[]), allowed);
    }

    #[test]
    fn exact_and_wildcard_entries_match() {
        let rules = rules(&["https://studio.example.com", "*.corp.example.org"]);
        assert!(origin_allowed(
            Some("https://studio.example.com"),
            "gw.example.com",
            &rules
        ));
        assert!(origin_allowed(
            Some("https://tools.corp.example.org"),
            "gw.example.com",
            &rules
        ));
        assert!(!origin_allowed(
            Some("https://corp.example.org.evil.com"),
            "gw.example.com",
            &rules
        ));
    }

    #[test]
    fn cidr_entries_match_ipv4_origins() {
        let rules = rules(&["10.1.0.0/16"]);
        assert!(origin_allowed(Some("http://10.1.42.7"), "gw.example.com", &rules));
        assert!(!origin_allowed(Some("http://10.2.0.1"), "gw.example.com", &rules));
    }

    #[test]
    fn invalid_cidr_is_skipped_not_fatal() {
        let rules = rules(&["10.1.0.0/99", "300.0.0.1/8", "*.ok.example.com"]);
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn token_length_boundary_is_exact() {
        let max = 16;
        let exact = "a".repeat(16);
        assert!(validate_token_value(&exact, max).is_ok());
        let over = "a".repeat(17);
        assert!(validate_token_value(&over, max).is_err());
    }

    #[rstest]
    #[case("glpat-abc123_DEF.45~+/==", true)]
    #[case("has space", false)]
    #[case("quote\"inside", false)]
    #[case("", false)]
    fn token_shape_is_strict(#[case] token: &str, #[case] ok: bool) {
        assert_eq!(validate_token_value(token, 1000).is_ok(), ok);
    }

    #[test]
    fn extract_prefers_bearer_and_rejects_malformed() {
        use secrecy::ExposeSecret;

        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer tok123".parse().unwrap());
        let token = extract_client_token(&headers, 1000).unwrap().unwrap();
        assert_eq!(token.expose_secret(), "tok123");

        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert!(extract_client_token(&headers, 1000).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-token", "tok456".parse().unwrap());
        let token = extract_client_token(&headers, 1000).unwrap().unwrap();
        assert_eq!(token.expose_secret(), "tok456");

        assert!(extract_client_token(&HeaderMap::new(), 1000).unwrap().is_none());
    }

    #[tokio::test]
    async fn token_validator_accepts_2xx_and_rejects_the_rest() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/check")
            .match_header("authorization", "Bearer good")
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("GET", "/check")
            .match_header("authorization", "Bearer bad")
            .with_status(401)
            .create_async()
            .await;

        let auth: crate::profile::AuthConfig = serde_json::from_value(serde_json::json!({
            "type": "bearer",
            "value_from_env": "UNUSED",
            "validation_endpoint": format!("{}/check", server.url()),
            "validation_timeout_ms": 2000
        }))
        .unwrap();
        let validator = TokenValidator::from_auth(&auth).unwrap();
        assert!(validator.validate("good").await.is_ok());
        assert!(validator.validate("bad").await.is_err());
    }

    #[test]
    fn token_validator_requires_an_endpoint() {
        let auth: crate::profile::AuthConfig = serde_json::from_value(serde_json::json!({
            "type": "bearer",
            "value_from_env": "UNUSED"
        }))
        .unwrap();
        assert!(TokenValidator::from_auth(&auth).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ip_limiter_is_per_ip_and_refills() {
        let limiter = RequestRateLimiter::new(2, Duration::from_secs(60));
        let a: IpAddr = "203.0.113.5".parse().unwrap();
        let b: IpAddr = "203.0.113.6".parse().unwrap();

        assert!(limiter.try_acquire(a));
        assert!(limiter.try_acquire(a));
        assert!(!limiter.try_acquire(a));
        assert!(limiter.try_acquire(b));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.try_acquire(a));
    }
}
