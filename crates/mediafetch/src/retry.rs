// Retry policy: exponential backoff with jitter, a delay cap and error classification.
//
// Shared by the chunked fetcher (whole-request retries with resume) and the
// fragment downloader (whole-fragment retries).

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{EngineError, ErrorKind};

/// Outcome of [`RetryPolicy::next_delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given duration, then try again.
    Retry(Duration),
    GiveUp,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries (not counting the initial attempt).
    pub max_retries: u32,
    /// Base delay. Retry `n` waits `base * 2^(n-1)` plus jitter.
    pub base_delay_ms: u64,
    /// Hard cap on any computed delay, including server `Retry-After` hints.
    pub max_delay_ms: u64,
    /// Adds random jitter of `[0, base/2)` so parallel fragment fetches do not retry in lockstep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay_ms: u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX),
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Whether an error of `kind` may ever be retried.
    pub fn is_retryable(kind: ErrorKind) -> bool {
        kind == ErrorKind::TransientNetwork
    }

    /// Decide what to do before retry number `attempt` (1-based).
    ///
    /// Gives up when `attempt > max_retries` or immediately for non-retryable kinds.
    pub fn next_delay(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if !Self::is_retryable(kind) || attempt == 0 || attempt > self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for_attempt(attempt - 1))
    }

    /// Compute the delay for a 0-indexed exponent.
    fn delay_for_attempt(&self, exponent: u32) -> Duration {
        let base = self.base_delay();
        let max = self.max_delay();
        // 2^exponent through a checked shift so exponents >= 32 saturate.
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let capped = base.checked_mul(multiplier).unwrap_or(max).min(max);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = self.base_delay_ms / 2;
        let remaining_ms = u64::try_from(max.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(max)
    }

    /// Apply a server `Retry-After` hint on top of the computed backoff.
    pub(crate) fn with_hint(&self, delay: Duration, retry_after_secs: Option<u64>) -> Duration {
        match retry_after_secs {
            Some(secs) => delay.max(Duration::from_secs(secs)).min(self.max_delay()),
            None => delay,
        }
    }
}

/// Terminal failure of [`retry_with_backoff`].
#[derive(Debug)]
pub struct RetryExhausted {
    pub error: EngineError,
    /// Total attempts made, including the first.
    pub attempts: u32,
}

/// Execute an async operation with retry-and-backoff.
///
/// The `operation` closure receives the current attempt number (0-indexed).
/// Errors are classified through [`EngineError::kind`]; only transient ones
/// are retried. Cancellation is observed before each attempt and during sleeps.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if token.is_cancelled() {
            return Err(RetryExhausted {
                error: EngineError::Cancelled,
                attempts: attempt,
            });
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        attempt += 1;

        let delay = match policy.next_delay(attempt, err.kind()) {
            RetryDecision::Retry(delay) => policy.with_hint(delay, err.retry_after_secs()),
            RetryDecision::GiveUp => {
                return Err(RetryExhausted {
                    error: err,
                    attempts: attempt,
                });
            }
        };

        warn!(
            attempt,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        tokio::select! {
            _ = token.cancelled() => {
                return Err(RetryExhausted { error: EngineError::Cancelled, attempts: attempt });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
