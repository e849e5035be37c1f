//! Per-client circuit breaker.
//!
//! The circuit opens after `failure_threshold` consecutive failed attempts
//! and rejects requests with [`RestError::CircuitOpen`] until `delay` has
//! passed. It then lets requests through half-open: `success_threshold`
//! successes in a row close it again, a single failure reopens it.
//!
//! An attempt fails when the transport fails or the server answers with a
//! 5xx status.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::duration_serde;
use crate::error::RestError;

/// Circuit breaker settings. Absent from the client configuration by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed attempts that open the circuit (default: 5)
    pub failure_threshold: u32,

    /// Time the circuit stays open before trial requests pass (default: 60s)
    #[serde(with = "duration_serde")]
    pub delay: Duration,

    /// Consecutive half-open successes that close the circuit (default: 1)
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            delay: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

/// State of a client's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass
    Closed,
    /// Requests are rejected
    Open,
    /// Trial requests pass; the next outcome decides
    HalfOpen,
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Instant,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    config: CircuitBreakerConfig,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    pub(crate) fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: Instant::now(),
            }),
        }
    }

    /// Moves an open circuit to half-open once the delay has passed.
    fn refresh(&self, counters: &mut Counters) {
        if counters.state == CircuitState::Open && counters.opened_at.elapsed() >= self.config.delay {
            counters.state = CircuitState::HalfOpen;
            counters.successes = 0;
            tracing::debug!("circuit breaker half-open");
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        let mut counters = self.counters.lock();
        self.refresh(&mut counters);
        counters.state
    }

    /// Admits one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::CircuitOpen`] while the circuit is open.
    pub(crate) fn acquire(&self) -> Result<(), RestError> {
        let mut counters = self.counters.lock();
        self.refresh(&mut counters);
        if counters.state == CircuitState::Open {
            let retry_after = self.config.delay.saturating_sub(counters.opened_at.elapsed());
            return Err(RestError::CircuitOpen { retry_after });
        }
        Ok(())
    }

    pub(crate) fn record(&self, failed: bool) {
        let mut counters = self.counters.lock();
        match (counters.state, failed) {
            (CircuitState::Closed, false) => counters.failures = 0,
            (CircuitState::Closed, true) => {
                counters.failures += 1;
                if counters.failures >= self.config.failure_threshold.max(1) {
                    Self::open(&mut counters);
                    tracing::warn!(failures = counters.failures, "circuit breaker opened");
                }
            }
            (CircuitState::HalfOpen, false) => {
                counters.successes += 1;
                if counters.successes >= self.config.success_threshold.max(1) {
                    counters.state = CircuitState::Closed;
                    counters.failures = 0;
                    tracing::info!("circuit breaker closed");
                }
            }
            (CircuitState::HalfOpen, true) => {
                Self::open(&mut counters);
                tracing::warn!("circuit breaker reopened after a failed trial request");
            }
            // attempts admitted before the circuit opened
            (CircuitState::Open, _) => {}
        }
    }

    fn open(counters: &mut Counters) {
        counters.state = CircuitState::Open;
        counters.opened_at = Instant::now();
        counters.successes = 0;
    }
}
