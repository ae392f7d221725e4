//! Bounded retry with exponential backoff.
//!
//! A [`RetryPolicy`] bundles the attempt budget, the backoff curve and the predicate that decides
//! which failures are worth another attempt. The policy is a plain value: each call to
//! [`RetryPolicy::run`] keeps its own attempt counter, so concurrent callers never share backoff
//! state.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Attempt budget, backoff curve and retryable classification for one kind of operation.
#[derive(Debug)]
pub struct RetryPolicy<E> {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor applied to the delay after every retry
    pub multiplier: f64,
    /// Returns true for failures that may succeed on a later attempt
    pub retryable: fn(&E) -> bool,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for RetryPolicy<E> {}

/// Terminal outcome of a retried operation that never succeeded
#[derive(Error, Debug)]
pub enum RetryError<E: fmt::Display> {
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("non-retryable failure on attempt {attempts}: {error}")]
    NonRetryable { attempts: u32, error: E },
}

impl<E: fmt::Display> RetryError<E> {
    /// Number of attempts made and the last underlying error
    pub fn into_parts(self) -> (u32, E) {
        match self {
            RetryError::Exhausted { attempts, last } => (attempts, last),
            RetryError::NonRetryable { attempts, error } => (attempts, error),
        }
    }
}

impl<E> RetryPolicy<E> {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        multiplier: f64,
        retryable: fn(&E) -> bool,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
            retryable,
        }
    }

    /// Delay slept before retry number `retry` (zero-based): `base_delay * multiplier^retry`.
    ///
    /// Curves that overflow or turn non-finite saturate to [`Duration::MAX`]; negative ones
    /// collapse to zero.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay,
            Err(_) if secs < 0.0 => Duration::ZERO,
            Err(_) => Duration::MAX,
        }
    }

    /// Run `operation` until it succeeds, fails non-retryably, or the attempt budget is spent.
    ///
    /// The closure receives the one-based attempt number. Attempts are strictly sequential: the
    /// next one is only created after the previous future resolved and its backoff elapsed.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !(self.retryable)(&error) {
                return Err(RetryError::NonRetryable {
                    attempts: attempt,
                    error,
                });
            }

            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.delay_for(attempt - 1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying after backoff"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[derive(Debug)]
    enum Failure {
        Busy,
        Fatal,
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Failure::Busy => write!(f, "busy"),
                Failure::Fatal => write!(f, "fatal"),
            }
        }
    }

    fn is_busy(failure: &Failure) -> bool {
        matches!(failure, Failure::Busy)
    }

    fn policy() -> RetryPolicy<Failure> {
        RetryPolicy::new(5, Duration::from_millis(1200), 1.8, is_busy)
    }

    fn assert_close(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff <= Duration::from_millis(1),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn test_delay_curve() {
        let policy = policy();
        assert_close(policy.delay_for(0), 1200);
        assert_close(policy.delay_for(1), 2160);
        assert_close(policy.delay_for(2), 3888);
        assert_close(policy.delay_for(3), 6998);
    }

    #[test]
    fn test_delay_saturates_instead_of_panicking() {
        let policy = policy();
        assert_eq!(policy.delay_for(5_000), Duration::MAX);
        assert_eq!(policy.delay_for(u32::MAX), Duration::MAX);

        let negative = RetryPolicy::new(5, Duration::from_millis(100), -1.0, is_busy);
        assert_eq!(negative.delay_for(1), Duration::ZERO);
        assert_eq!(negative.delay_for(2), Duration::from_millis(100));

        let undefined = RetryPolicy::new(5, Duration::from_millis(100), f64::NAN, is_busy);
        assert_eq!(undefined.delay_for(1), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts() {
        let mut stamps = Vec::new();

        let result = policy()
            .run(|attempt| {
                stamps.push(Instant::now());
                async move {
                    if attempt < 4 {
                        Err(Failure::Busy)
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(stamps.len(), 4);
        assert_close(stamps[1] - stamps[0], 1200);
        assert_close(stamps[2] - stamps[1], 2160);
        assert_close(stamps[3] - stamps[2], 3888);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let mut calls = 0;

        let result: Result<(), _> = policy()
            .run(|_| {
                calls += 1;
                async { Err(Failure::Fatal) }
            })
            .await;

        assert_eq!(calls, 1);
        assert!(matches!(
            result,
            Err(RetryError::NonRetryable {
                attempts: 1,
                error: Failure::Fatal
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_keeps_last_error() {
        let mut calls = 0;

        let result: Result<(), _> = policy()
            .run(|_| {
                calls += 1;
                async { Err(Failure::Busy) }
            })
            .await;

        assert_eq!(calls, 5);
        let (attempts, last) = result.unwrap_err().into_parts();
        assert_eq!(attempts, 5);
        assert!(matches!(last, Failure::Busy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10), 2.0, is_busy);
        let mut calls = 0;

        let result: Result<(), _> = policy
            .run(|_| {
                calls += 1;
                async { Err(Failure::Busy) }
            })
            .await;

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
    }
}
