//! Credential injection. The primary (lowest priority number) non-OAuth auth
//! spec is applied to every outgoing request; OAuth is handled at the
//! transport layer and never reaches this interceptor.

use http::header::AUTHORIZATION;
use http::{Extensions, HeaderName, HeaderValue};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use secrecy::{ExposeSecret, SecretString};

use crate::errors::GatewayError;
use crate::profile::AuthSpec;

#[derive(Debug)]
enum Scheme {
    Bearer,
    Query { param: String },
    Header { name: HeaderName },
}

#[derive(Debug)]
pub struct AuthInterceptor {
    scheme: Scheme,
    token: SecretString,
}

impl AuthInterceptor {
    /// Resolve the credential at construction time. `session_token` takes
    /// precedence over the configured environment variable; a missing
    /// credential is fatal here so requests never go out unsigned.
    pub fn from_spec(
        spec: &AuthSpec,
        session_token: Option<SecretString>,
    ) -> Result<Self, GatewayError> {
        let scheme = match spec {
            AuthSpec::Bearer { .. } => Scheme::Bearer,
            AuthSpec::Query { query_param, .. } => Scheme::Query {
                param: query_param.clone(),
            },
            AuthSpec::CustomHeader { header_name, .. } => Scheme::Header {
                name: header_name.parse::<HeaderName>().map_err(|_| {
                    GatewayError::configuration(format!(
                        "invalid auth header name {header_name:?}"
                    ))
                })?,
            },
            AuthSpec::Oauth { .. } => {
                return Err(GatewayError::configuration(
                    "oauth auth specs are transport-level and cannot back an interceptor",
                ));
            }
        };

        let token = match session_token {
            Some(token) => token,
            None => {
                let env_var = spec.value_from_env().unwrap_or_default();
                let value = std::env::var(env_var).map_err(|_| {
                    GatewayError::authentication(format!(
                        "missing API token: set the {env_var} environment variable, \
                         or supply a per-session token via the Authorization header"
                    ))
                })?;
                SecretString::from(value)
            }
        };

        Ok(Self { scheme, token })
    }
}

#[async_trait::async_trait]
impl Middleware for AuthInterceptor {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        match &self.scheme {
            Scheme::Bearer => {
                let mut value = HeaderValue::from_str(&format!(
                    "Bearer {}",
                    self.token.expose_secret()
                ))
                .map_err(|e| reqwest_middleware::Error::Middleware(e.into()))?;
                value.set_sensitive(true);
                req.headers_mut().insert(AUTHORIZATION, value);
            }
            Scheme::Header { name } => {
                let mut value = HeaderValue::from_str(self.token.expose_secret())
                    .map_err(|e| reqwest_middleware::Error::Middleware(e.into()))?;
                value.set_sensitive(true);
                req.headers_mut().insert(name.clone(), value);
            }
            Scheme::Query { param } => {
                // Appended, preserving whatever query string is already there.
                req.url_mut()
                    .query_pairs_mut()
                    .append_pair(param, self.token.expose_secret());
            }
        }
        next.run(req, extensions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::InterceptorConfig;
    use crate::sanitize::Sanitizer;
    use crate::upstream::{RequestContext, UpstreamClient};
    use http::Method;
    use serde_json::json;
    use std::time::Duration;
    use url::Url;

    fn config(auth: serde_json::Value) -> InterceptorConfig {
        serde_json::from_value(json!({ "auth": auth })).unwrap()
    }

    fn client(auth: serde_json::Value, token: &str) -> UpstreamClient {
        UpstreamClient::build(
            &config(auth),
            Some(SecretString::from(token.to_string())),
            Duration::from_secs(5),
            Sanitizer::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn bearer_token_is_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ping")
            .match_header("authorization", "Bearer t0ken")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = client(json!({ "type": "bearer", "value_from_env": "UNUSED" }), "t0ken");
        let url: Url = format!("{}/ping", server.url()).parse().unwrap();
        client
            .execute(RequestContext::new(Method::GET, url))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn custom_header_is_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ping")
            .match_header("private-token", "t0ken")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = client(
            json!({ "type": "custom-header", "value_from_env": "UNUSED",
                    "header_name": "PRIVATE-TOKEN" }),
            "t0ken",
        );
        let url: Url = format!("{}/ping", server.url()).parse().unwrap();
        client
            .execute(RequestContext::new(Method::GET, url))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn query_token_preserves_existing_parameters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ping")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("page".into(), "2".into()),
                mockito::Matcher::UrlEncoded("private_token".into(), "t0ken".into()),
            ]))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = client(
            json!({ "type": "query", "value_from_env": "UNUSED",
                    "query_param": "private_token" }),
            "t0ken",
        );
        let url: Url = format!("{}/ping", server.url()).parse().unwrap();
        let mut ctx = RequestContext::new(Method::GET, url);
        ctx.query.push(("page".to_string(), json!(2)));
        client.execute(ctx).await.unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn missing_env_token_is_fatal_and_names_the_variable() {
        let spec: AuthSpec = serde_json::from_value(json!({
            "type": "bearer",
            "value_from_env": "DEFINITELY_NOT_SET_ANYWHERE_12345"
        }))
        .unwrap();
        let err = AuthInterceptor::from_spec(&spec, None).unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
        assert!(err.to_string().contains("DEFINITELY_NOT_SET_ANYWHERE_12345"));
        assert!(err.to_string().contains("Authorization header"));
    }
}
