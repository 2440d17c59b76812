//! Redaction of configured secrets before anything reaches a log record.

use std::sync::Arc;

use http::HeaderMap;

const REDACTED: &str = "[REDACTED]";

/// Knows every secret the process was configured with and strips them from
/// arbitrary text. Shared across interceptors and the transport so a log
/// statement can never leak a live credential.
#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
    secrets: Arc<Vec<String>>,
}

impl Sanitizer {
    pub fn new(secrets: Vec<String>) -> Self {
        // Short strings redact too aggressively; a real token is never 1-3 chars.
        let secrets = secrets
            .into_iter()
            .filter(|s| s.len() >= 4)
            .collect();
        Self {
            secrets: Arc::new(secrets),
        }
    }

    /// Replace every occurrence of a configured secret with `[REDACTED]`.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in self.secrets.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }

    /// Render headers for logging with authorization-bearing values masked
    /// entirely and configured secrets stripped from the rest.
    pub fn redact_headers(&self, headers: &HeaderMap) -> String {
        let mut parts = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            let shown = if is_sensitive_header(name.as_str()) {
                REDACTED.to_string()
            } else {
                match value.to_str() {
                    Ok(v) => self.redact(v),
                    Err(_) => "<binary>".to_string(),
                }
            };
            parts.push(format!("{name}: {shown}"));
        }
        parts.join(", ")
    }
}

fn is_sensitive_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "authorization"
        || name == "proxy-authorization"
        || name == "x-api-token"
        || name.contains("token")
        || name.contains("secret")
        || name.contains("api-key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{AUTHORIZATION, CONTENT_TYPE};

    #[test]
    fn redacts_secret_substrings() {
        let sanitizer = Sanitizer::new(vec!["s3cret".to_string()]);
        let record = r#"{"headers":{"Authorization":"Bearer s3cret"}}"#;
        let redacted = sanitizer.redact(record);
        assert!(redacted.contains(REDACTED));
        assert!(!redacted.contains("s3cret"));
    }

    #[test]
    fn leaves_clean_text_alone() {
        let sanitizer = Sanitizer::new(vec!["s3cret".to_string()]);
        assert_eq!(sanitizer.redact("nothing to hide"), "nothing to hide");
    }

    #[test]
    fn masks_auth_headers_wholesale() {
        let sanitizer = Sanitizer::new(vec![]);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer whatever".parse().unwrap());
        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        let rendered = sanitizer.redact_headers(&headers);
        assert!(!rendered.contains("whatever"));
        assert!(rendered.contains("application/json"));
    }

    #[test]
    fn ignores_trivially_short_secrets() {
        let sanitizer = Sanitizer::new(vec!["a".to_string()]);
        assert_eq!(sanitizer.redact("banana"), "banana");
    }
}
