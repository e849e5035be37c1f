//! Optional retry policy applied around a single logical request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_serde;
use crate::error::RestError;
use crate::request::Method;

/// Upper bound for a single backoff delay, whatever the configuration says.
const BACKOFF_CEILING_SECS: f64 = 86_400.0;

/// Exponential backoff: `min(initial * multiplier^attempt, max)`, plus up to
/// 25% random jitter when enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExponentialBackoff {
    #[serde(with = "duration_serde")]
    pub initial: Duration,
    #[serde(with = "duration_serde")]
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// 1ms initial, 100ms max, no jitter.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// Non-finite or negative settings are replaced by safe values instead of
    /// panicking inside `Duration::from_secs_f64`.
    #[must_use]
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier = finite_non_negative(self.multiplier).unwrap_or(1.0);
        let initial = finite_non_negative(self.initial.as_secs_f64()).unwrap_or(0.0);
        let max = finite_non_negative(self.max.as_secs_f64())
            .map_or(BACKOFF_CEILING_SECS, |m| m.min(BACKOFF_CEILING_SECS));

        let raw = initial * multiplier.powi(exponent);
        let secs = if raw.is_finite() { raw.clamp(0.0, max) } else { max };
        let delay = Duration::from_secs_f64(secs);

        if !self.jitter {
            return delay;
        }
        let factor: f64 = rand::rng().random_range(0.0..=0.25);
        delay + Duration::from_secs_f64(secs * factor)
    }
}

fn finite_non_negative(value: f64) -> Option<f64> {
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Why an attempt counted as failed.
#[derive(Debug, Clone, Copy)]
pub enum AttemptFailure<'a> {
    /// The server answered with one of the retryable statuses
    Status(i32),
    /// The attempt produced no usable response
    Error(&'a RestError),
}

/// Callback observing failed attempts.
pub type RetryListener = Arc<dyn Fn(&AttemptFailure<'_>) + Send + Sync>;

/// Callbacks of the retry loop; never serialized.
#[derive(Clone, Default)]
pub struct RetryListeners {
    /// Called for every failed attempt, the last one included
    pub on_failed_attempt: Option<RetryListener>,
    /// Called once when the final allowed attempt has failed too
    pub on_retries_exceeded: Option<RetryListener>,
}

impl fmt::Debug for RetryListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryListeners")
            .field("on_failed_attempt", &self.on_failed_attempt.is_some())
            .field("on_retries_exceeded", &self.on_retries_exceeded.is_some())
            .finish()
    }
}

impl RetryListeners {
    pub(crate) fn failed_attempt(&self, failure: &AttemptFailure<'_>) {
        if let Some(listener) = &self.on_failed_attempt {
            listener(failure);
        }
    }

    pub(crate) fn retries_exceeded(&self, failure: &AttemptFailure<'_>) {
        if let Some(listener) = &self.on_retries_exceeded {
            listener(failure);
        }
    }
}

/// Retry policy. Absent from the client configuration by default.
///
/// Retryable statuses are retried for every method; transport failures only
/// for idempotent methods unless `retry_non_idempotent` is set, since the
/// server may already have acted on the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub backoff: ExponentialBackoff,
    pub retry_statuses: Vec<u16>,
    pub retry_non_idempotent: bool,
    #[serde(skip)]
    pub listeners: RetryListeners,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
            retry_statuses: vec![429, 502, 503, 504],
            retry_non_idempotent: false,
            listeners: RetryListeners::default(),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Calls `listener` for every failed attempt.
    #[must_use]
    pub fn on_failed_attempt(mut self, listener: impl Fn(&AttemptFailure<'_>) + Send + Sync + 'static) -> Self {
        self.listeners.on_failed_attempt = Some(Arc::new(listener));
        self
    }

    /// Calls `listener` once the last allowed attempt has failed.
    #[must_use]
    pub fn on_retries_exceeded(mut self, listener: impl Fn(&AttemptFailure<'_>) + Send + Sync + 'static) -> Self {
        self.listeners.on_retries_exceeded = Some(Arc::new(listener));
        self
    }

    #[must_use]
    pub fn should_retry_status(&self, status: i32) -> bool {
        u16::try_from(status).is_ok_and(|s| self.retry_statuses.contains(&s))
    }

    #[must_use]
    pub fn should_retry_error(&self, error: &RestError, method: Method) -> bool {
        error.is_transport() && (self.retry_non_idempotent || method.is_idempotent())
    }
}
