//! Bounded retry with exponential backoff.
//!
//! [`RetryPolicy::execute`] runs a fallible async operation. Each failure is
//! classified as [`ErrorClass::Transient`] (retried) or
//! [`ErrorClass::Permanent`] (returned immediately). Delays grow as
//! `base * multiplier^n`, capped at `max_delay`, plus optional jitter. The
//! delay actually slept never decreases from one retry to the next.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Default number of attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default growth factor between retries.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default ceiling for a single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Upper bound of jitter as a fraction of the computed delay.
const JITTER_FRACTION: f64 = 0.25;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, reset, 5xx, throttling.
    Transient,
    /// Auth failure, not found, malformed request.
    Permanent,
}

/// Classify a [`StoreError`] by its kind.
#[must_use]
pub fn classify_store_error(err: &StoreError) -> ErrorClass {
    if err.is_transient() {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// Why [`RetryPolicy::execute`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed transiently.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        last: E,
    },
    /// A permanent failure stopped the loop.
    Permanent {
        /// Attempts made, including the failing one.
        attempts: u32,
        /// The error.
        error: E,
    },
}

impl<E> RetryError<E> {
    /// The number of attempts that were made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Permanent { attempts, .. } => *attempts,
        }
    }

    /// Consume and return the underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Permanent { error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, last } => {
                write!(f, "retries exhausted after {attempts} attempts: {last}")
            }
            Self::Permanent { attempts, error } => {
                write!(f, "permanent failure on attempt {attempts}: {error}")
            }
        }
    }
}

/// Retry settings.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use blobrelay_core::retry::RetryPolicy;
///
/// let policy = RetryPolicy::new(4)
///     .with_backoff(Duration::from_millis(100), 2.0)
///     .with_max_delay(Duration::from_millis(250));
/// assert_eq!(policy.delay_for(0), Duration::from_millis(100));
/// assert_eq!(policy.delay_for(1), Duration::from_millis(200));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` (at least one) and default backoff.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Set the first delay and the growth factor (values below 1 are treated as 1).
    #[must_use]
    pub fn with_backoff(mut self, base_delay: Duration, multiplier: f64) -> Self {
        self.base_delay = base_delay;
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            DEFAULT_MULTIPLIER
        };
        self
    }

    /// Cap a single delay.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Attempts allowed, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before retry number `retry` (zero-based), without jitter.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let scaled = self.base_delay.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * JITTER_FRACTION;
        let extra = rand::rng().random_range(0.0..=spread);
        delay + Duration::from_secs_f64(extra)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the one-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Permanent`] on the first permanent failure, or
    /// [`RetryError::Exhausted`] after `max_attempts` transient failures.
    pub async fn execute<T, E, F, Fut, C>(&self, mut op: F, classify: C) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: fmt::Display,
    {
        let mut attempt = 0;
        let mut previous = Duration::ZERO;

        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded on retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if classify(&err) == ErrorClass::Permanent {
                debug!(attempt, error = %err, "permanent failure, not retrying");
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error: err,
                });
            }

            if attempt >= self.max_attempts {
                warn!(
                    attempt,
                    max_attempts = self.max_attempts,
                    error = %err,
                    "transient failure, retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let backoff = self
                .jittered(self.delay_for(attempt - 1))
                .max(previous)
                .min(self.max_delay.max(previous));
            previous = backoff;

            warn!(
                attempt,
                max_attempts = self.max_attempts,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "transient failure, retrying after backoff"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
