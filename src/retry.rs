//! Bounded exponential backoff for provider calls.
//!
//! Every attempt runs under its own timeout. Failures for which
//! [`RagError::is_transient`] holds (rate limits, 5xx responses,
//! connection errors, timeouts) are retried after
//! `base × 2^(attempt-1)`, capped at `max`; anything else is returned
//! immediately.

use std::future::Future;
use std::time::Duration;

use lexrag_core::{RagError, Result};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            base,
            max,
        }
    }

    /// 1s, 2s, 4s, … capped at 32s.
    pub fn with_default_backoff(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::from_secs(1), Duration::from_secs(32))
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << exp).min(self.max)
    }
}

/// Run `call` until it succeeds, fails permanently, or retries run out.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    timeout: Duration,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(RagError::Timeout {
                operation: operation.to_string(),
                secs: timeout.as_secs(),
            }),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
