//! Shared retry-with-backoff helper used at the transport-read "again" point.
//!
//! Exponential backoff with optional jitter and a hard delay cap, matching
//! the error-handling policy: retries live only here, never re-wrapped
//! further up the stack.

use crate::error::HlsError;
use crate::interrupt::Interrupt;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    /// The worker loop's "again" retry point (§4.2): a fixed 20 ms
    /// cooperative backoff, retried until the operation succeeds or the
    /// caller is cancelled rather than failing after a bounded count.
    fn default() -> Self {
        Self {
            max_retries: u32::MAX,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }

        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Outcome of a single attempt, decided by the caller.
pub enum RetryAction<T> {
    Success(T),
    Retry(HlsError),
    Fail(HlsError),
}

pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    interrupt: &Interrupt,
    mut operation: F,
) -> Result<T, HlsError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    for attempt in 0..=policy.max_retries {
        if interrupt.is_cancelled() {
            return Err(HlsError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient transport error"
                );
                tokio::select! {
                    _ = interrupt.cancelled() => return Err(HlsError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(HlsError::internal("retry loop exited without result"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_for_attempt_respects_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_millis(500));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(350),
            jitter: true,
        };
        for attempt in 0..5 {
            let d = policy.delay_for_attempt(attempt);
            assert!(d <= Duration::from_millis(350));
        }
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        let interrupt = Interrupt::new();
        let result: Result<i32, HlsError> =
            retry_with_backoff(&policy, &interrupt, |_| async { RetryAction::Success(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn fails_immediately_on_non_retryable() {
        let policy = RetryPolicy::default();
        let interrupt = Interrupt::new();
        let result: Result<i32, HlsError> = retry_with_backoff(&policy, &interrupt, |_| async {
            RetryAction::Fail(HlsError::Parse("bad".into()))
        })
        .await;
        assert!(matches!(result, Err(HlsError::Parse(_))));
    }

    #[tokio::test]
    async fn exhausts_then_fails() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        };
        let interrupt = Interrupt::new();
        let attempts = AtomicU32::new(0);
        let result: Result<i32, HlsError> = retry_with_backoff(&policy, &interrupt, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { RetryAction::Retry(HlsError::Transport("again".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn respects_cancellation() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        let interrupt = Interrupt::new();
        interrupt.cancel();
        let result: Result<i32, HlsError> = retry_with_backoff(&policy, &interrupt, |_| async {
            RetryAction::Retry(HlsError::Transport("again".into()))
        })
        .await;
        assert!(matches!(result, Err(HlsError::Cancelled)));
    }
}
