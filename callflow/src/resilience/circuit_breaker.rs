//! Three-state failure breaker.
//!
//! ```text
//! CLOSED    --[failure_count >= failure_threshold]--> OPEN
//! OPEN      --[now >= next_attempt_time]-----------> HALF_OPEN
//! HALF_OPEN --[half_open_retry_count successes]----> CLOSED
//! HALF_OPEN --[any failure]------------------------> OPEN
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_retry_count() -> u32 {
    1
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing trial calls.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Trial calls allowed while half-open; all must succeed to close.
    #[serde(default = "default_half_open_retry_count")]
    pub half_open_retry_count: u32,
    /// Service to call instead while the circuit is open.
    #[serde(default)]
    pub fallback_service: Option<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_retry_count: default_half_open_retry_count(),
            fallback_service: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a configuration with the given threshold and reset timeout.
    #[must_use]
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout_ms: u64::try_from(reset_timeout.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    /// Sets the half-open trial count.
    #[must_use]
    pub fn with_half_open_retry_count(mut self, count: u32) -> Self {
        self.half_open_retry_count = count;
        self
    }

    /// Sets the fallback service.
    #[must_use]
    pub fn with_fallback_service(mut self, service_id: impl Into<String>) -> Self {
        self.fallback_service = Some(service_id.into());
        self
    }

    /// Returns the reset timeout as a duration.
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// The state of a circuit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    #[default]
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// A bounded number of trial calls are allowed.
    HalfOpen,
}

/// Point-in-time view of a breaker, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures counted since the last reset.
    pub failure_count: u32,
    /// Trial calls admitted in the current half-open period.
    pub half_open_attempts: u32,
    /// Milliseconds until trial calls are allowed, while open.
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
    half_open_attempts: u32,
    half_open_successes: u32,
}

/// A per-key circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state without side effects.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns whether a call may proceed, consuming a trial slot when half-open.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let ready = inner
                .next_attempt_time
                .map_or(true, |next| Instant::now() >= next);
            if !ready {
                return false;
            }
            info!("Circuit breaker entering half-open state");
            inner.state = CircuitState::HalfOpen;
            inner.half_open_attempts = 0;
            inner.half_open_successes = 0;
        }

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_retry_count {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Admits a call, returning a permit that settles the outcome.
    ///
    /// A permit dropped without a verdict hands its half-open trial slot
    /// back, so abandoned calls never strand the breaker in `HalfOpen`.
    #[must_use]
    pub fn admit(&self) -> Option<BreakerPermit<'_>> {
        self.is_allowed().then_some(BreakerPermit {
            breaker: self,
            settled: false,
        })
    }

    /// Returns an admitted half-open trial slot without a verdict.
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_attempts = inner.half_open_attempts.saturating_sub(1);
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_retry_count {
                    info!("Circuit breaker closed after successful trial calls");
                    *inner = BreakerState::default();
                }
            }
            // A call admitted before the circuit opened; it does not close it.
            CircuitState::Open => {}
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(now);

        let should_open = match inner.state {
            CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            warn!(
                failure_count = inner.failure_count,
                reset_timeout_ms = self.config.reset_timeout_ms,
                "Circuit breaker opened"
            );
            inner.state = CircuitState::Open;
            inner.next_attempt_time = Some(now + self.config.reset_timeout());
            inner.half_open_attempts = 0;
            inner.half_open_successes = 0;
        }
    }

    /// Forces the breaker back to closed.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::default();
    }

    /// Returns a snapshot for reporting.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        let retry_in_ms = match (inner.state, inner.next_attempt_time) {
            (CircuitState::Open, Some(next)) => Some(
                u64::try_from(next.saturating_duration_since(Instant::now()).as_millis())
                    .unwrap_or(u64::MAX),
            ),
            _ => None,
        };
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_attempts: inner.half_open_attempts,
            retry_in_ms,
        }
    }
}

/// An admitted call against a [`CircuitBreaker`].
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Records a success. Later verdicts on the same permit are ignored.
    pub fn succeed(&mut self) {
        if !std::mem::replace(&mut self.settled, true) {
            self.breaker.record_success();
        }
    }

    /// Records a failure. Later verdicts on the same permit are ignored.
    pub fn fail(&mut self) {
        if !std::mem::replace(&mut self.settled, true) {
            self.breaker.record_failure();
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Call abandoned without a verdict, releasing breaker trial");
            self.breaker.release_trial();
        }
    }
}
