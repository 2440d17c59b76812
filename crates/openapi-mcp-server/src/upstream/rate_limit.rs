//! Token-bucket rate limiting: one global bucket plus per-operation
//! overrides. Waiting is cooperative and never holds a bucket lock across an
//! await point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use http::Extensions;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use tokio::time::Instant;

use crate::profile::RateLimitConfig;
use crate::upstream::OperationTag;

/// Continuous-refill token bucket. `capacity` is requests per minute;
/// refill rate is `capacity / 60000` tokens per millisecond.
pub struct TokenBucket {
    capacity: f64,
    refill_per_ms: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(requests_per_minute: u32) -> Self {
        let capacity = f64::from(requests_per_minute.max(1));
        Self {
            capacity,
            refill_per_ms: capacity / 60_000.0,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Refill, then either consume a token (`None`) or report how long the
    /// caller must wait before polling again.
    pub fn poll(&mut self, now: Instant) -> Option<Duration> {
        let elapsed_ms = now.duration_since(self.last_refill).as_millis() as f64;
        self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let wait_ms = (1.0 - self.tokens) / self.refill_per_ms;
            Some(Duration::from_millis(wait_ms.ceil() as u64))
        }
    }
}

pub struct RateLimitInterceptor {
    global: Mutex<TokenBucket>,
    overrides: HashMap<String, Mutex<TokenBucket>>,
}

impl RateLimitInterceptor {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            global: Mutex::new(TokenBucket::new(config.max_requests_per_minute)),
            overrides: config
                .operation_overrides
                .iter()
                .map(|(id, rpm)| (id.clone(), Mutex::new(TokenBucket::new(*rpm))))
                .collect(),
        }
    }

    /// Block until the selected bucket grants a token. The lock is released
    /// before every sleep so concurrent requests and cancellation stay
    /// responsive.
    async fn acquire(&self, operation_id: Option<&str>) {
        let bucket = operation_id
            .and_then(|id| self.overrides.get(id))
            .unwrap_or(&self.global);
        loop {
            let wait = {
                let Ok(mut bucket) = bucket.lock() else {
                    return;
                };
                bucket.poll(Instant::now())
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[async_trait::async_trait]
impl Middleware for RateLimitInterceptor {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let operation_id = extensions.get::<OperationTag>().map(|tag| tag.0.clone());
        self.acquire(operation_id.as_deref()).await;
        next.run(req, extensions).await
    }
}
