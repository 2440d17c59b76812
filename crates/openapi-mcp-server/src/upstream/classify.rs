//! Mapping of non-2xx upstream responses onto the closed error set.

use http::{HeaderMap, StatusCode, header::RETRY_AFTER};
use serde_json::Value;

use crate::errors::GatewayError;

/// Classify a non-2xx upstream response. Exactly one error kind per status.
pub fn classify_status(status: StatusCode, body: &str, headers: &HeaderMap) -> GatewayError {
    let message = extract_message(status, body);
    match status.as_u16() {
        401 => GatewayError::Authentication { message },
        403 => GatewayError::Authorization { message },
        429 => GatewayError::RateLimit {
            message,
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok()),
        },
        code @ 400..=499 => GatewayError::Client {
            status: code,
            message,
        },
        code => GatewayError::Server {
            status: Some(code),
            message,
        },
    }
}

/// Pull a human-readable message out of common error body shapes, falling
/// back to the raw body, then to the bare status line.
fn extract_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        for field in ["error_description", "error", "message"] {
            if let Some(text) = parsed.get(field).and_then(Value::as_str) {
                if !text.is_empty() {
                    return text.to_string();
                }
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed.to_string()
    }
}
