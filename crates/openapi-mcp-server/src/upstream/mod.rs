//! The upstream HTTP client and its interceptor chain. Cross-cutting
//! concerns are reqwest middlewares composed once per client in a fixed
//! order: auth (mutates the request) -> rate limit (may delay) -> retry
//! (drives the terminal send).

mod auth;
mod classify;
mod rate_limit;
mod retry;

pub use auth::AuthInterceptor;
pub use classify::classify_status;
pub use rate_limit::{RateLimitInterceptor, TokenBucket};
pub use retry::RetryInterceptor;

use http::{HeaderMap, Method};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use secrecy::SecretString;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::errors::GatewayError;
use crate::profile::{ArrayFormat, InterceptorConfig};
use crate::sanitize::Sanitizer;

/// Carried through request extensions so the rate-limit interceptor can pick
/// a per-operation bucket.
#[derive(Clone)]
pub(crate) struct OperationTag(pub String);

/// One outgoing upstream request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    /// Absolute URL without query parameters.
    pub url: Url,
    pub headers: HeaderMap,
    /// Query parameters with their raw JSON values; arrays are serialized at
    /// send time per the configured [`ArrayFormat`].
    pub query: Vec<(String, Value)>,
    pub body: Option<Value>,
    pub operation_id: Option<String>,
}

impl RequestContext {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            operation_id: None,
        }
    }
}

/// The upstream response with its body already parsed as JSON.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub status: u16,
    pub body: Value,
}

/// Upstream client: one reqwest client behind the interceptor chain.
#[derive(Debug)]
pub struct UpstreamClient {
    http: ClientWithMiddleware,
    array_format: ArrayFormat,
    sanitizer: Sanitizer,
}

impl UpstreamClient {
    /// Build a client from the interceptor configuration. `session_token`
    /// overrides the env-sourced credential for per-session clients. A
    /// missing credential is a fatal configuration error here, not at
    /// request time.
    pub fn build(
        config: &InterceptorConfig,
        session_token: Option<SecretString>,
        request_timeout: Duration,
        sanitizer: Sanitizer,
    ) -> Result<Self, GatewayError> {
        let inner = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                GatewayError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        let mut builder = ClientBuilder::new(inner);
        if let Some(auth) = config.auth.as_ref().and_then(|a| a.primary()) {
            builder = builder.with(AuthInterceptor::from_spec(auth, session_token)?);
        }
        if let Some(rate_limit) = &config.rate_limit {
            builder = builder.with(RateLimitInterceptor::new(rate_limit));
        }
        if let Some(retry) = &config.retry {
            builder = builder.with(RetryInterceptor::new(retry.clone()));
        }

        Ok(Self {
            http: builder.build(),
            array_format: config.array_format,
            sanitizer,
        })
    }

    /// Send one request through the chain and classify the outcome.
    pub async fn execute(&self, ctx: RequestContext) -> Result<ResponseContext, GatewayError> {
        let mut url = ctx.url;
        append_query(&mut url, self.array_format, &ctx.query);

        tracing::debug!(
            method = %ctx.method,
            url = %self.sanitizer.redact(url.as_str()),
            operation_id = ctx.operation_id.as_deref().unwrap_or("-"),
            "upstream request"
        );

        let mut request = self
            .http
            .request(ctx.method, url)
            .headers(ctx.headers);
        if let Some(operation_id) = &ctx.operation_id {
            request = request.with_extension(OperationTag(operation_id.clone()));
        }
        if let Some(body) = &ctx.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| GatewayError::Server {
            status: None,
            message: self
                .sanitizer
                .redact(&format!("upstream request failed: {e}")),
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.map_err(|e| GatewayError::Server {
            status: Some(status.as_u16()),
            message: format!("failed to read upstream response: {e}"),
        })?;

        if !status.is_success() {
            return Err(classify_status(status, &text, &headers));
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(ResponseContext {
            status: status.as_u16(),
            body,
        })
    }
}

/// Serialize query parameters, expanding arrays per the configured format.
fn append_query(url: &mut Url, format: ArrayFormat, query: &[(String, Value)]) {
    if query.is_empty() {
        return;
    }
    let mut pairs = url.query_pairs_mut();
    for (name, value) in query {
        match value {
            Value::Array(items) => match format {
                ArrayFormat::Brackets => {
                    for item in items {
                        pairs.append_pair(&format!("{name}[]"), &scalar(item));
                    }
                }
                ArrayFormat::Indices => {
                    for (i, item) in items.iter().enumerate() {
                        pairs.append_pair(&format!("{name}[{i}]"), &scalar(item));
                    }
                }
                ArrayFormat::Repeat => {
                    for item in items {
                        pairs.append_pair(name, &scalar(item));
                    }
                }
                ArrayFormat::Comma => {
                    let joined = items.iter().map(scalar).collect::<Vec<_>>().join(",");
                    pairs.append_pair(name, &joined);
                }
            },
            other => {
                pairs.append_pair(name, &scalar(other));
            }
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::RetryConfig;
    use rstest::rstest;
    use serde_json::json;

    fn url_with(format: ArrayFormat, query: &[(String, Value)]) -> String {
        let mut url: Url = "https://api.example.com/v4/items".parse().unwrap();
        append_query(&mut url, format, query);
        url.to_string()
    }

    #[rstest]
    #[case(ArrayFormat::Brackets, "https://api.example.com/v4/items?labels%5B%5D=a&labels%5B%5D=b")]
    #[case(ArrayFormat::Indices, "https://api.example.com/v4/items?labels%5B0%5D=a&labels%5B1%5D=b")]
    #[case(ArrayFormat::Repeat, "https://api.example.com/v4/items?labels=a&labels=b")]
    #[case(ArrayFormat::Comma, "https://api.example.com/v4/items?labels=a%2Cb")]
    fn array_formats(#[case] format: ArrayFormat, #[case] expected: &str) {
        let query = vec![("labels".to_string(), json!(["a", "b"]))];
        assert_eq!(url_with(format, &query), expected);
    }

    #[test]
    fn scalars_preserve_existing_semantics() {
        let query = vec![
            ("page".to_string(), json!(2)),
            ("archived".to_string(), json!(false)),
            ("search".to_string(), json!("rust gateway")),
        ];
        assert_eq!(
            url_with(ArrayFormat::Repeat, &query),
            "https://api.example.com/v4/items?page=2&archived=false&search=rust+gateway"
        );
    }

    #[tokio::test]
    async fn executes_and_parses_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/projects/1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":1,"name":"proj"}"#)
            .create_async()
            .await;

        let client = UpstreamClient::build(
            &InterceptorConfig::default(),
            None,
            Duration::from_secs(5),
            Sanitizer::default(),
        )
        .unwrap();

        let url: Url = format!("{}/projects/1", server.url()).parse().unwrap();
        let ctx = RequestContext::new(Method::GET, url);
        let response = client.execute(ctx).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"id": 1, "name": "proj"}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_2xx_is_classified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/projects/1")
            .with_status(404)
            .with_body(r#"{"message":"404 Project Not Found"}"#)
            .create_async()
            .await;

        let client = UpstreamClient::build(
            &InterceptorConfig::default(),
            None,
            Duration::from_secs(5),
            Sanitizer::default(),
        )
        .unwrap();

        let url: Url = format!("{}/projects/1", server.url()).parse().unwrap();
        let err = client
            .execute(RequestContext::new(Method::GET, url))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Client { status: 404, .. }));
        assert!(err.to_string().contains("404 Project Not Found"));
    }

    #[tokio::test]
    async fn retries_listed_statuses_until_attempts_run_out() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let config = InterceptorConfig {
            retry: Some(RetryConfig {
                max_attempts: 3,
                backoff_ms: vec![1],
                retry_on_status: vec![503],
            }),
            ..Default::default()
        };
        let client =
            UpstreamClient::build(&config, None, Duration::from_secs(5), Sanitizer::default())
                .unwrap();

        let url: Url = format!("{}/flaky", server.url()).parse().unwrap();
        let err = client
            .execute(RequestContext::new(Method::GET, url))
            .await
            .unwrap_err();
        // The final failure surfaces the last response.
        assert!(matches!(err, GatewayError::Server { status: Some(503), .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn does_not_retry_unlisted_4xx() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/nope")
            .with_status(400)
            .with_body(r#"{"error":"bad request"}"#)
            .expect(1)
            .create_async()
            .await;

        let config = InterceptorConfig {
            retry: Some(RetryConfig {
                max_attempts: 3,
                backoff_ms: vec![1],
                retry_on_status: vec![429, 503],
            }),
            ..Default::default()
        };
        let client =
            UpstreamClient::build(&config, None, Duration::from_secs(5), Sanitizer::default())
                .unwrap();

        let url: Url = format!("{}/nope", server.url()).parse().unwrap();
        let err = client
            .execute(RequestContext::new(Method::GET, url))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Client { status: 400, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn single_attempt_disables_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let config = InterceptorConfig {
            retry: Some(RetryConfig {
                max_attempts: 1,
                backoff_ms: vec![1],
                retry_on_status: vec![503],
            }),
            ..Default::default()
        };
        let client =
            UpstreamClient::build(&config, None, Duration::from_secs(5), Sanitizer::default())
                .unwrap();

        let url: Url = format!("{}/flaky", server.url()).parse().unwrap();
        let err = client
            .execute(RequestContext::new(Method::GET, url))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Server { status: Some(503), .. }));
        mock.assert_async().await;
    }
}
