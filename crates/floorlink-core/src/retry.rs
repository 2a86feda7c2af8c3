//! Retry and timeout wrappers
//!
//! [`with_retry`] runs sequential attempts with a delay between them and
//! returns the last error once attempts are exhausted. Only retryable errors
//! (timeouts, transport failures) are retried; validation and state errors
//! surface on the first attempt. Cancellation is observed both during an
//! attempt and during the delay.

use crate::error::LoaderError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attempt schedule for [`with_retry`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Delay before the first retry
    pub delay: Duration,
    /// Growth factor per retry; `1.0` keeps the delay fixed
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Fixed-delay policy
    #[inline]
    #[must_use]
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Single attempt, no retries
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// With exponential growth
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.multiplier = multiplier.max(1.0);
        self.max_delay = max_delay.max(self.delay);
        self
    }

    /// Delay to wait after failed attempt number `attempt` (0-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.multiplier <= 1.0 {
            return self.delay;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        if !factor.is_finite() {
            return self.max_delay;
        }
        self.delay.mul_f64(factor).min(self.max_delay)
    }

    /// Total attempts, including the first
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    /// Three retries, one second apart
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. `op` receives the 0-based attempt number.
///
/// # Errors
/// - the last error from `op` once attempts are exhausted
/// - the first non-retryable error from `op`
/// - `LoaderError::Cancelled` if `token` fires
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, LoaderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LoaderError>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(LoaderError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => Err(LoaderError::Cancelled),
            result = op(attempt) => result,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() || attempt >= policy.retries => {
                if attempt > 0 {
                    tracing::warn!(attempts = attempt + 1, error = %error, "giving up");
                }
                return Err(error);
            }
            Err(error) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, error = %error, "attempt failed, retrying");
                tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(LoaderError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Race `fut` against a timer.
///
/// # Errors
/// `LoaderError::Timeout` if `duration` elapses first, otherwise whatever
/// `fut` returns.
pub async fn with_timeout<T, Fut>(duration: Duration, fut: Fut) -> Result<T, LoaderError>
where
    Fut: Future<Output = Result<T, LoaderError>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(LoaderError::timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn fixed_policy_delay() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(100));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn backoff_policy_is_capped() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(100))
            .with_backoff(2.0, Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = RetryPolicy::fixed(3, Duration::from_millis(50));
        let token = CancellationToken::new();

        let result = with_retry(&policy, &token, move |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LoaderError::network("flaky"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rethrows_last_error_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = RetryPolicy::fixed(2, Duration::from_millis(10));
        let token = CancellationToken::new();

        let result: Result<(), _> = with_retry(&policy, &token, move |attempt| {
            c.fetch_add(1, Ordering::SeqCst);
            async move { Err(LoaderError::network(format!("attempt {attempt}"))) }
        })
        .await;

        assert_eq!(result, Err(LoaderError::network("attempt 2")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));
        let token = CancellationToken::new();

        let result: Result<(), _> = with_retry(&policy, &token, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(LoaderError::validation("missing equipment")) }
        })
        .await;

        assert!(matches!(result, Err(LoaderError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_delay() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(60));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = with_retry(&policy, &token, |_| async {
            Err(LoaderError::network("down"))
        })
        .await;

        assert_eq!(result, Err(LoaderError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_slow_operation() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(LoaderError::Timeout { duration_ms: 100 }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_passes_fast_result_through() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, LoaderError>(1) }).await;
        assert_eq!(result, Ok(1));
    }
}
