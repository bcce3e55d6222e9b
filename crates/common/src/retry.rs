use crate::circuit_breaker::{CircuitBreaker, CircuitOpen};
use crate::config::RetrySettings;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff with jitter around one fallible async call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self {
            retries: settings.retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Upper bound of the delay before retry number `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Ceiling scaled by a uniform factor in [0.5, 1.0].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        self.ceiling(attempt).mul_f64(factor)
    }

    /// Run `operation`, retrying errors accepted by `is_retryable`.
    ///
    /// Non-retryable errors are returned on first occurrence without
    /// consuming any of the retry budget.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation_name: &str,
        is_retryable: P,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => {
                    debug!(operation = operation_name, error = %e, "non-retryable failure");
                    return Err(e);
                }
                Err(e) if attempt >= self.retries => {
                    warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = %e,
                        "retry budget exhausted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        retries = self.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Breaker check, then the retry loop, then exactly one outcome report.
///
/// A refusal from the breaker is returned as `E` without running
/// `operation` and without touching the breaker's counters.
pub async fn guarded<T, E, F, Fut, P>(
    operation_name: &str,
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    is_retryable: P,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display + From<CircuitOpen>,
{
    breaker.check().await?;
    match policy.run(operation_name, is_retryable, operation).await {
        Ok(value) => {
            breaker.record_success().await;
            Ok(value)
        }
        Err(e) => {
            breaker.record_failure().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("bad input")]
        Bad,
        #[error(transparent)]
        Open(#[from] CircuitOpen),
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            retries: 2,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(4000),
        }
    }

    #[test]
    fn test_delay_bounds() {
        let p = policy();
        assert_eq!(p.ceiling(0), Duration::from_millis(400));
        assert_eq!(p.ceiling(1), Duration::from_millis(800));
        assert_eq!(p.ceiling(10), Duration::from_millis(4000));

        for attempt in 0..5 {
            let d = p.delay_for(attempt);
            assert!(d >= p.ceiling(attempt) / 2);
            assert!(d <= p.ceiling(attempt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, TestError> = policy()
            .run(
                "op",
                |e| matches!(e, TestError::Flaky),
                move || async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(TestError::Flaky)
                    } else {
                        Ok(n)
                    }
                },
            )
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), TestError> = policy()
            .run(
                "op",
                |e| matches!(e, TestError::Flaky),
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Bad)
                },
            )
            .await;
        assert!(matches!(result, Err(TestError::Bad)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_reports_once_per_call() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            name: "db".to_string(),
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        });
        let calls = AtomicU32::new(0);
        let counter = &calls;

        // Three internal attempts, one breaker failure.
        let result: Result<(), TestError> = guarded(
            "op",
            &cb,
            &policy(),
            |e| matches!(e, TestError::Flaky),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.failure_count().await, 1);
        assert_eq!(cb.state().await, CircuitState::Closed);

        let _: Result<(), TestError> =
            guarded("op", &cb, &policy(), |_| false, || async { Err(TestError::Bad) }).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        let before = calls.load(Ordering::SeqCst);
        let refused: Result<(), TestError> = guarded(
            "op",
            &cb,
            &policy(),
            |_| true,
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;
        assert!(matches!(refused, Err(TestError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }
}
