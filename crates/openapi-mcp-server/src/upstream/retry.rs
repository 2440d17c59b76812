//! Bounded retry with a configured backoff table. Sits innermost in the
//! chain so every attempt goes through the terminal send and nothing else.

use std::time::Duration;

use http::Extensions;
use reqwest::{Request, Response};
use reqwest_middleware::{Error, Middleware, Next};
use tracing::debug;

use crate::profile::RetryConfig;

pub struct RetryInterceptor {
    config: RetryConfig,
}

impl RetryInterceptor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    fn should_retry(&self, outcome: &Result<Response, Error>) -> bool {
        match outcome {
            Ok(response) => self
                .config
                .retry_on_status
                .contains(&response.status().as_u16()),
            Err(Error::Reqwest(e)) => e.is_timeout() || e.is_connect(),
            Err(Error::Middleware(_)) => false,
        }
    }
}

#[async_trait::async_trait]
impl Middleware for RetryInterceptor {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            // Streaming bodies cannot be replayed; send them exactly once.
            let Some(cloned) = req.try_clone() else {
                return next.run(req, extensions).await;
            };
            let outcome = next.clone().run(cloned, extensions).await;
            attempt += 1;

            if attempt >= max_attempts || !self.should_retry(&outcome) {
                return outcome;
            }

            let backoff = self.config.backoff_for_attempt(attempt - 1);
            debug!(
                attempt,
                max_attempts,
                backoff_ms = backoff,
                "retrying upstream request"
            );
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }
}
