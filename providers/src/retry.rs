//! HTTP retry policy with exponential backoff.
//!
//! # Retry Policy
//!
//! - Max attempts: 3 (initial request included)
//! - Delay before retry `n` (0-based): `base_delay * 2^n`, so 1s, 2s with defaults
//!
//! # Retryable Conditions
//!
//! - HTTP 5xx
//! - Request timeouts and other transport errors
//!
//! Connection refusal is never retried: an agent server that is not
//! listening will not start listening within a few seconds.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, initial request included. Zero behaves as one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each later one.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0 before the second request).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2_u32.saturating_pow(attempt))
    }
}

#[must_use]
pub fn should_retry(status: StatusCode) -> bool {
    status.is_server_error()
}

/// Outcome of a retry operation.
///
/// Success and failure are distinct variants so callers cannot treat an
/// error response as a reply.
#[derive(Debug)]
pub enum RetryOutcome {
    /// 2xx response.
    Success(Response),
    /// 4xx response, or 5xx after exhausting attempts. Kept for body inspection.
    HttpError(Response),
    /// Every attempt timed out.
    TimedOut { attempts: u32 },
    /// Server refused the connection; not retried.
    ConnectFailed(reqwest::Error),
    /// Other transport failure after exhausting attempts.
    Transport { attempts: u32, source: reqwest::Error },
}

impl RetryOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Send a request with automatic retries.
///
/// `build_request` is called once per attempt.
pub async fn send_with_retry<F>(build_request: F, config: &RetryConfig) -> RetryOutcome
where
    F: Fn() -> RequestBuilder,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let last = attempt + 1 >= max_attempts;
        let failure = match build_request().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return RetryOutcome::Success(response);
                }
                if !should_retry(status) || last {
                    if should_retry(status) {
                        tracing::error!(
                            status = %status,
                            attempts = max_attempts,
                            "Agent request failed after retries"
                        );
                    }
                    return RetryOutcome::HttpError(response);
                }
                format!("server error {status}")
            }
            Err(e) if e.is_connect() => {
                tracing::error!(error = %e, "Agent connection failed");
                return RetryOutcome::ConnectFailed(e);
            }
            Err(e) if last => {
                tracing::error!(error = %e, attempts = max_attempts, "Agent request failed after retries");
                if e.is_timeout() {
                    return RetryOutcome::TimedOut {
                        attempts: max_attempts,
                    };
                }
                return RetryOutcome::Transport {
                    attempts: max_attempts,
                    source: e,
                };
            }
            Err(e) => e.to_string(),
        };

        let delay = config.backoff_delay(attempt);
        tracing::warn!(
            retry = attempt + 1,
            max_attempts,
            delay_ms = delay.as_millis(),
            reason = %failure,
            "Retrying agent request"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
