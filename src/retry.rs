// Bounded retry with backoff, shared by chunk uploads and the single-shot upload.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^retry`; with a 1s base: 2s, 4s, 8s.
    Exponential { base: Duration },
    /// `step * retry`; with a 2s step: 2s, 4s.
    Linear { step: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, base: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { base },
        }
    }

    pub fn linear(max_retries: u32, step: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Linear { step },
        }
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Exponential { base } => base.saturating_mul(2u32.saturating_pow(retry)),
            Backoff::Linear { step } => step.saturating_mul(retry),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or retries run out.
/// `op` receives the 0-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.max_retries && is_retryable(&e) => {
                attempt += 1;
                let wait = policy.delay_for(attempt);
                warn!(
                    operation,
                    error = %e,
                    retry = attempt,
                    max_retries = policy.max_retries,
                    wait_ms = wait.as_millis() as u64,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}
