// Retry-with-backoff shared by the playlist client and the segment
// downloader: exponential delay growth with jitter and a hard cap.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, TimeShiftError};

/// Backoff schedule for repeated attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; each further retry doubles it.
    pub base_delay: Duration,
    /// No computed delay ever exceeds this.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, 0.3 * exponential delay).
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Delay to wait after attempt number `attempt` (0-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // The shift saturates for large attempt numbers; the cap below is
        // what bounds the result either way.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);

        if !self.jitter {
            return exp_delay.min(self.max_delay);
        }

        let jitter_range_ms = (exp_delay.as_millis() as u64 * 3) / 10;
        let jitter = if jitter_range_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_range_ms))
        };
        (exp_delay + jitter).min(self.max_delay)
    }
}

/// What a single attempt decided about its own failure.
pub enum RetryAction<T> {
    Success(T),
    /// Failed with a retryable error (network, 5xx, timeout, 408/429).
    Retry(TimeShiftError),
    /// Failed with a non-retryable error.
    Fail(TimeShiftError),
}

/// Drive `operation` until it succeeds, fails terminally, runs out of
/// retries, or the token is cancelled.
///
/// The closure gets the attempt number (0-indexed) and classifies its own
/// outcome as a [`RetryAction`]; the backoff schedule between attempts
/// comes from `policy`.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(TimeShiftError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };
        if attempt >= policy.max_retries {
            return Err(err);
        }

        let backoff = policy.delay_for_attempt(attempt);
        warn!(
            error = %err,
            backoff_ms = backoff.as_millis() as u64,
            retries_left = policy.max_retries - attempt,
            "Transient failure; backing off"
        );
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TimeShiftError::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retryable_err() -> TimeShiftError {
        TimeShiftError::segment_fetch("503 upstream", ErrorCategory::Server)
    }

    #[test]
    fn delay_doubles_per_attempt_without_jitter() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1000));
    }

    #[test]
    fn delay_respects_max_cap() {
        let policy = RetryPolicy {
            max_retries: 16,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        // 500ms * 2^12 is far past the cap.
        assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(5));
        // Degenerate attempt numbers saturate rather than wrap.
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_below_thirty_percent() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            jitter: true,
        };
        for _ in 0..64 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay < Duration::from_millis(1300));
        }
    }

    #[test]
    fn jittered_delay_never_exceeds_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };
        for _ in 0..64 {
            assert!(policy.delay_for_attempt(10) <= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let token = CancellationToken::new();
        let result =
            retry_with_backoff(&policy, &token, |_| async { RetryAction::Success(42u32) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::Fail(TimeShiftError::segment_fetch(
                    "404 not found",
                    ErrorCategory::Client,
                ))
            }
        })
        .await;
        assert!(result.is_err());
        // A terminal classification gets no second attempt.
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausts_retry_budget_then_fails() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(retryable_err()) }
        })
        .await;
        assert!(result.is_err());
        // One initial attempt plus the two allowed retries.
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn recovers_on_second_attempt() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(&policy, &token, |attempt| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt == 0 {
                    RetryAction::Retry(retryable_err())
                } else {
                    RetryAction::Success(99u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(100));
        let token = CancellationToken::new();
        token.cancel();
        // The operation is never even attempted.
        let attempts = AtomicU32::new(0);
        let result: Result<u32> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Success(1u32) }
        })
        .await;
        assert!(matches!(result, Err(TimeShiftError::Cancelled)));
        assert_eq!(attempts.load(Ordering::Relaxed), 0);
    }
}
