//! Health endpoint configuration and payload.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub sessions: usize,
}

impl HealthStatus {
    pub fn ok(sessions: usize) -> Self {
        Self {
            status: "ok",
            sessions,
        }
    }
}
