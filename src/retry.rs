//! Shared retry policy for every outbound HTTP call.
//!
//! One policy covers Slack, S3, and Bedrock requests:
//!
//! - HTTP 429 → wait the `Retry-After` hint (seconds, default 1), retry
//! - HTTP 5xx, configured extra statuses, network errors → wait
//!   `2^attempt` backoff units (attempt counted from 0), retry
//! - Any other non-success → fail immediately
//! - Attempts exhausted → [`HarvestError::FetchAborted`]
//!
//! Waiting goes through the [`Sleeper`] trait so tests can record the
//! waits instead of sleeping.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{AttemptFailure, HarvestError, Result};

/// Suspends the current task between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real waits on the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records every requested wait and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut waits) = self.waits.lock() {
            waits.push(duration);
        }
    }
}

const MAX_BACKOFF_EXPONENT: u32 = 5;
const ERROR_BODY_LIMIT: usize = 500;

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    extra_statuses: Vec<u16>,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            extra_statuses: Vec::new(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_extra_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.extra_statuses = statuses;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        status == 429 || (500..600).contains(&status) || self.extra_statuses.contains(&status)
    }

    /// Backoff before the attempt following `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << attempt.min(MAX_BACKOFF_EXPONENT))
    }

    /// Send a request built fresh for every attempt.
    ///
    /// Returns the first successful (2xx) response.
    pub async fn send<F>(&self, endpoint: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        self.run(endpoint, |_| {
            let request = build();
            async move {
                match request.send().await {
                    Ok(resp) => self.classify(endpoint, resp).await,
                    Err(e) => Err(AttemptFailure::Retryable(HarvestError::TransientHttp {
                        endpoint: endpoint.to_string(),
                        status: None,
                        detail: e.to_string(),
                    })),
                }
            }
        })
        .await
    }

    async fn classify(
        &self,
        endpoint: &str,
        resp: Response,
    ) -> std::result::Result<Response, AttemptFailure> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(1);
            return Err(AttemptFailure::RateLimited {
                retry_after: Duration::from_secs(secs),
            });
        }

        let body = resp.text().await.unwrap_or_default();
        let detail = format!(
            "HTTP {}: {}",
            status.as_u16(),
            body.chars().take(ERROR_BODY_LIMIT).collect::<String>()
        );

        if self.is_retryable_status(status.as_u16()) {
            Err(AttemptFailure::Retryable(HarvestError::TransientHttp {
                endpoint: endpoint.to_string(),
                status: Some(status.as_u16()),
                detail,
            }))
        } else {
            Err(AttemptFailure::Fatal(HarvestError::api(endpoint, detail)))
        }
    }

    /// Drive `op` under this policy. `op` receives the 0-based attempt.
    pub(crate) async fn run<T, F, Fut>(&self, endpoint: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptFailure>>,
    {
        let mut last = String::new();

        for attempt in 0..self.max_attempts {
            let wait = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(AttemptFailure::Fatal(err)) => return Err(err),
                Err(AttemptFailure::RateLimited { retry_after }) => {
                    tracing::warn!(
                        endpoint,
                        attempt = attempt + 1,
                        wait_secs = retry_after.as_secs(),
                        "rate limited"
                    );
                    last = "HTTP 429: rate limited".to_string();
                    retry_after
                }
                Err(AttemptFailure::Retryable(err)) => {
                    tracing::warn!(endpoint, attempt = attempt + 1, error = %err, "attempt failed");
                    last = match err {
                        HarvestError::TransientHttp { detail, .. } => detail,
                        other => other.to_string(),
                    };
                    self.backoff(attempt)
                }
            };

            if attempt + 1 < self.max_attempts {
                self.sleeper.sleep(wait).await;
            }
        }

        Err(HarvestError::FetchAborted {
            endpoint: endpoint.to_string(),
            attempts: self.max_attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn policy(sleeper: Arc<RecordingSleeper>) -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100)).with_sleeper(sleeper)
    }

    fn transient() -> AttemptFailure {
        AttemptFailure::Retryable(HarvestError::TransientHttp {
            endpoint: "test".into(),
            status: Some(503),
            detail: "HTTP 503: unavailable".into(),
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::new(10, Duration::from_secs(1));
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(2), Duration::from_secs(4));
        assert_eq!(p.backoff(9), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn succeeds_first_try_without_waiting() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let out = policy(sleeper.clone())
            .run("test", |_| async { Ok::<_, AttemptFailure>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_waits_server_hint_once() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let out = policy(sleeper.clone())
            .run("test", |attempt| async move {
                if attempt == 0 {
                    Err(AttemptFailure::RateLimited {
                        retry_after: Duration::from_secs(7),
                    })
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert_eq!(sleeper.waits(), vec![Duration::from_secs(7)]);
    }

    #[tokio::test]
    async fn exhausts_budget_with_exponential_backoff() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut calls = 0;
        let err = policy(sleeper.clone())
            .run("conversations.history", |_| {
                calls += 1;
                async { Err::<(), _>(transient()) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls, 3);
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert_eq!(
            sleeper.waits(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut calls = 0;
        let err = policy(sleeper.clone())
            .run("test", |_| {
                calls += 1;
                async { Err::<(), _>(AttemptFailure::Fatal(HarvestError::api("test", "HTTP 404"))) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.kind(), ErrorKind::ApiLogic);
        assert!(sleeper.waits().is_empty());
    }

    #[test]
    fn extra_statuses_are_retryable() {
        let p = RetryPolicy::default().with_extra_statuses(vec![408]);
        assert!(p.is_retryable_status(408));
        assert!(p.is_retryable_status(429));
        assert!(p.is_retryable_status(502));
        assert!(!p.is_retryable_status(400));
    }
}
