//! Retry with exponential backoff and jitter.
//!
//! Every backend call goes through [`retry`]. The failure of each attempt is
//! already classified; Auth and NotFound end the loop at once, Unknown gets a
//! single extra attempt, everything else retries until the policy runs out.
//! Attempts and sleeps race the cancellation token, so cancelling never
//! waits for a backoff to finish and never turns into a [`DomainError`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DomainError, ErrorKind, FetchError};

/// Upper bound on a single backoff sleep before jitter.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; the operation runs at most `max_retries + 1` times.
    pub max_retries: u32,
    /// Sleep before the first retry. Doubles for every further retry.
    pub initial_backoff: Duration,
    /// Each sleep is stretched by a random factor in `[0, jitter_fraction)`.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, jitter_fraction: f64) -> Self {
        Self {
            max_retries,
            initial_backoff,
            jitter_fraction,
        }
    }

    /// `initial_backoff * 2^attempt`, capped at [`MAX_BACKOFF`].
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(multiplier)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    /// Sleep before retry number `attempt + 1` (attempt is 0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_fraction <= 0.0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..self.jitter_fraction);
        base.mul_f64(1.0 + jitter)
    }
}

/// Observation passed to the retry hook before each backoff sleep.
#[derive(Debug)]
pub struct RetryEvent<'a> {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub delay: Duration,
    pub error: &'a DomainError,
}

/// Run `operation` under `policy`. The closure receives the 0-based attempt number.
pub async fn retry<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DomainError>>,
{
    retry_observed(policy, token, |_| {}, operation).await
}

/// [`retry`] with a hook that sees every scheduled backoff.
pub async fn retry_observed<F, Fut, T, O>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut observer: O,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DomainError>>,
    O: FnMut(&RetryEvent<'_>),
{
    let mut attempt = 0u32;
    let mut unknown_retried = false;

    loop {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let fut = operation(attempt);
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            result = fut => result,
        };

        let err = match outcome {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let kind = err.kind();
        if !kind.is_retryable() {
            debug!(kind = %kind, "Not retrying");
            return Err(err.into());
        }
        if attempt >= policy.max_retries {
            debug!(attempts = attempt + 1, "Retries exhausted");
            return Err(err.into());
        }
        if kind == ErrorKind::Unknown {
            if unknown_retried {
                return Err(err.into());
            }
            unknown_retried = true;
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt = attempt + 1,
            max = policy.max_retries + 1,
            delay_ms = delay.as_millis() as u64,
            kind = %kind,
            error = %err,
            "Retrying after failure"
        );
        observer(&RetryEvent {
            attempt: attempt + 1,
            delay,
            error: &err,
        });

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
