use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 1_000, max_delay_ms: 10_000, backoff_multiplier: 2.0 }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the zero-based `attempt` failed:
    /// `base * multiplier^attempt`, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay_ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt ceiling is reached. The closure receives the zero-based attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    event_name = "retry.attempt_failed",
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retryable failure; backing off"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use thiserror::Error;
    use tokio::time::Instant;

    use super::{retry_with_backoff, RetryPolicy, Retryable};

    #[derive(Debug, Error)]
    enum FakeError {
        #[error("rate limited")]
        RateLimited,
        #[error("bad request")]
        BadRequest,
    }

    impl Retryable for FakeError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::RateLimited)
        }
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 3.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for(2), Duration::from_millis(900));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_retryable_failures_with_expected_delays() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 200,
            max_delay_ms: 500,
            backoff_multiplier: 2.0,
        };
        let started = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let result = retry_with_backoff(&policy, "resolve", |attempt| {
            let seen = seen.clone();
            async move {
                seen.lock().expect("lock").push(started.elapsed());
                if attempt < 3 {
                    Err(FakeError::RateLimited)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.expect("should succeed on the fourth attempt"), 3);
        let offsets = seen.lock().expect("lock").clone();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_millis(200),
                Duration::from_millis(600),
                Duration::from_millis(1_100),
            ]
        );
    }

    #[tokio::test]
    async fn non_retryable_error_aborts_after_one_attempt() {
        let calls = Arc::new(Mutex::new(0_u32));
        let result: Result<(), FakeError> =
            retry_with_backoff(&RetryPolicy::default(), "resolve", |_| {
                let calls = calls.clone();
                async move {
                    *calls.lock().expect("lock") += 1;
                    Err(FakeError::BadRequest)
                }
            })
            .await;

        assert!(matches!(result, Err(FakeError::BadRequest)));
        assert_eq!(*calls.lock().expect("lock"), 1);
    }

    #[tokio::test]
    async fn gives_up_at_attempt_ceiling() {
        let policy =
            RetryPolicy { max_attempts: 3, base_delay_ms: 0, max_delay_ms: 0, backoff_multiplier: 2.0 };
        let calls = Arc::new(Mutex::new(0_u32));
        let result: Result<(), FakeError> = retry_with_backoff(&policy, "resolve", |_| {
            let calls = calls.clone();
            async move {
                *calls.lock().expect("lock") += 1;
                Err(FakeError::RateLimited)
            }
        })
        .await;

        assert!(matches!(result, Err(FakeError::RateLimited)));
        assert_eq!(*calls.lock().expect("lock"), 3);
    }
}
