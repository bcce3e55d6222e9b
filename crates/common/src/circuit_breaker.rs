//! Circuit breaker for external dependencies.
//!
//! One instance guards one resource (a datasource pool, the chat endpoint,
//! the embedding endpoint). Every state transition happens inside a single
//! lock acquisition so concurrent callers on the same resource observe a
//! consistent check-then-act sequence.
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[cfg(feature = "telemetry")]
use opentelemetry::{global, metrics::Counter, KeyValue};

use crate::config::BreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Raised by [`CircuitBreaker::check`] when the call must not be attempted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit {name} is open")]
pub struct CircuitOpen {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl CircuitBreakerConfig {
    pub fn from_settings(name: impl Into<String>, settings: &BreakerSettings) -> Self {
        Self {
            name: name.into(),
            failure_threshold: settings.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(settings.recovery_timeout_secs.max(1)),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    // Set while the single half-open probe is outstanding.
    probe_started: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,

    #[cfg(feature = "telemetry")]
    transition_counter: Counter<u64>,
    #[cfg(feature = "telemetry")]
    rejected_counter: Counter<u64>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        #[cfg(feature = "telemetry")]
        let meter = global::meter("askql-circuit-breaker");
        #[cfg(feature = "telemetry")]
        let transition_counter = meter
            .u64_counter("circuit_breaker_transitions_total")
            .with_description("Total number of circuit breaker state transitions")
            .build();
        #[cfg(feature = "telemetry")]
        let rejected_counter = meter
            .u64_counter("circuit_breaker_rejections_total")
            .with_description("Calls refused without being attempted")
            .build();

        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_started: None,
            }),

            #[cfg(feature = "telemetry")]
            transition_counter,
            #[cfg(feature = "telemetry")]
            rejected_counter,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.failure_count
    }

    /// Admit or refuse a call.
    ///
    /// Closed admits everything. Open refuses until `recovery_timeout` has
    /// passed since the last failure, then moves to half-open and admits
    /// exactly one probe. Further callers are refused until the probe
    /// reports back (or the probe itself outlives `recovery_timeout`).
    pub async fn check(&self) -> Result<(), CircuitOpen> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();

        match guard.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = guard
                    .last_failure
                    .map(|t| now.duration_since(t))
                    .unwrap_or(self.config.recovery_timeout);
                if elapsed >= self.config.recovery_timeout {
                    self.transition(&mut guard, CircuitState::HalfOpen);
                    guard.probe_started = Some(now);
                    Ok(())
                } else {
                    Err(self.reject())
                }
            }
            CircuitState::HalfOpen => match guard.probe_started {
                Some(started) if now.duration_since(started) < self.config.recovery_timeout => {
                    Err(self.reject())
                }
                _ => {
                    // Previous probe never reported; let a new one through.
                    guard.probe_started = Some(now);
                    Ok(())
                }
            },
        }
    }

    pub async fn record_success(&self) {
        let mut guard = self.inner.lock().await;
        guard.failure_count = 0;
        guard.probe_started = None;
        if guard.state != CircuitState::Closed {
            self.transition(&mut guard, CircuitState::Closed);
        }
    }

    pub async fn record_failure(&self) {
        let mut guard = self.inner.lock().await;
        guard.failure_count = guard.failure_count.saturating_add(1);
        guard.last_failure = Some(Instant::now());
        guard.probe_started = None;

        let trip = guard.state == CircuitState::HalfOpen
            || guard.failure_count >= self.config.failure_threshold;
        if trip && guard.state != CircuitState::Open {
            self.transition(&mut guard, CircuitState::Open);
        }
    }

    fn reject(&self) -> CircuitOpen {
        #[cfg(feature = "telemetry")]
        self.rejected_counter
            .add(1, &[KeyValue::new("name", self.config.name.clone())]);

        CircuitOpen {
            name: self.config.name.clone(),
        }
    }

    fn transition(&self, guard: &mut BreakerState, to: CircuitState) {
        tracing::info!(
            target: "metrics",
            breaker = %self.config.name,
            from = %guard.state,
            to = %to,
            failures = guard.failure_count,
            "circuit breaker transition"
        );

        #[cfg(feature = "telemetry")]
        self.transition_counter.add(
            1,
            &[
                KeyValue::new("name", self.config.name.clone()),
                KeyValue::new("from", guard.state.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );

        guard.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            name: "test".to_string(),
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = breaker(3, 30);
        for _ in 0..2 {
            cb.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.check().await.is_ok());

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(cb.check().await.is_err());

        tokio::time::advance(Duration::from_secs(29)).await;
        let err = cb.check().await.unwrap_err();
        assert_eq!(err.name, "test");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let cb = breaker(2, 10);
        cb.record_failure().await;
        cb.record_failure().await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.check().await.is_ok());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        // Second caller while the probe is in flight.
        assert!(cb.check().await.is_err());

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.failure_count().await, 0);
        assert!(cb.check().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let cb = breaker(2, 10);
        cb.record_failure().await;
        cb.record_failure().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        cb.check().await.unwrap();

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(cb.check().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_is_replaced() {
        let cb = breaker(1, 5);
        cb.record_failure().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        cb.check().await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.check().await.is_ok());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_success_resets_count() {
        let cb = breaker(3, 30);
        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        assert_eq!(cb.failure_count().await, 1);
        assert_eq!(cb.state().await, CircuitState::Closed);
    }
}
