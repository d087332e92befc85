// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Retry and polling with exponential backoff.
//!
//! Two loops share one delay schedule. [`RetryPolicy::retry`] repeats a
//! fallible operation until it succeeds, fails fatally, or runs out of
//! attempts or time. [`RetryPolicy::wait_for_condition`] repeats a boolean
//! probe until it holds or time runs out, which is how Nixopus waits for a
//! service to come up before talking to it for real.
//!
//! The delay before retry `k` is `min(base * multiplier^(k - 1), max_delay)`.
//! When an overall timeout is set, a sleep never extends past the deadline,
//! so the last check happens right at the deadline. An operation already in
//! flight is never interrupted.

use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tokio::time::{sleep, Instant};

/// Classify errors as worth retrying or not.
pub trait Retryable {
    /// Whether another attempt might succeed.
    fn is_retryable(&self) -> bool;
}

/// Backoff schedule and bounds for repeated attempts.
///
/// # Invariant
///
/// - At least one of attempt limit or timeout is set.
/// - Multiplier is never below `1.0`, so delays never decrease.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Construct policy bounded by number of attempts, including the first.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            ..Self::default()
        }
    }

    /// Construct policy bounded only by overall elapsed time.
    pub fn deadline(timeout: Duration) -> Self {
        Self {
            max_attempts: None,
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set growth factor between consecutive delays, clamped to at least 1.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Bound total elapsed time in addition to any attempt limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Delay to wait after `failures` consecutive failed attempts.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }

        Duration::from_nanos(scaled.round() as u64).min(self.max_delay)
    }

    /// Run `operation` until it succeeds or this policy gives up.
    ///
    /// `on_retry` is told the number of the attempt that just failed, the
    /// delay about to be slept, and the error. It cannot influence the loop.
    ///
    /// # Errors
    ///
    /// - Return [`RetryError::Fatal`] as soon as the operation fails with a
    ///   non-retryable error.
    /// - Return [`RetryError::Exhausted`] with the last error if attempts or
    ///   time run out.
    pub async fn retry<T, E, Op, Fut, OnRetry>(
        &self,
        mut operation: Op,
        mut on_retry: OnRetry,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        OnRetry: FnMut(u32, Duration, &E),
    {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => return Err(RetryError::Fatal(error)),
                Err(error) => error,
            };

            let Some(delay) = self.next_delay(attempt, started) else {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            };

            on_retry(attempt, delay, &error);
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Poll `predicate` until it holds or this policy gives up.
    ///
    /// `on_retry` is told the number of the check that just failed, and the
    /// delay about to be slept.
    ///
    /// # Errors
    ///
    /// - Return [`TimeoutError`] carrying `timeout_message` if the predicate
    ///   never held.
    pub async fn wait_for_condition<P, Fut, OnRetry>(
        &self,
        mut predicate: P,
        mut on_retry: OnRetry,
        timeout_message: impl Into<String>,
    ) -> Result<(), TimeoutError>
    where
        P: FnMut() -> Fut,
        Fut: Future<Output = bool>,
        OnRetry: FnMut(u32, Duration),
    {
        let timeout_message = timeout_message.into();
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            if predicate().await {
                return Ok(());
            }

            let Some(delay) = self.next_delay(attempt, started) else {
                return Err(TimeoutError {
                    message: timeout_message,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                });
            };

            on_retry(attempt, delay);
            sleep(delay).await;
            attempt += 1;
        }
    }

    fn next_delay(&self, failures: u32, started: Instant) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| failures >= max) {
            return None;
        }

        let delay = self.delay_for(failures);
        match self.timeout {
            None => Some(delay),
            Some(timeout) => {
                let remaining = timeout.checked_sub(started.elapsed())?;
                (!remaining.is_zero()).then(|| delay.min(remaining))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            timeout: None,
        }
    }
}

/// Serializable form of [`RetryPolicy`] for settings files.
///
/// A zero attempt limit or a zero timeout means that bound is not set.
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,

    /// Upper bound of a single delay in milliseconds.
    pub max_delay_ms: u64,

    /// Overall time budget in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            timeout_ms: 0,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        let timeout = (settings.timeout_ms > 0).then(|| Duration::from_millis(settings.timeout_ms));
        let policy = match (settings.max_attempts, timeout) {
            (0, Some(timeout)) => RetryPolicy::deadline(timeout),
            // INVARIANT: Never build a policy that can loop forever.
            (0, None) => RetryPolicy::default(),
            (max, _) => RetryPolicy::attempts(max),
        };

        let policy = policy
            .with_base_delay(Duration::from_millis(settings.base_delay_ms))
            .with_multiplier(settings.multiplier)
            .with_max_delay(Duration::from_millis(settings.max_delay_ms));

        match timeout {
            Some(timeout) => policy.with_timeout(timeout),
            None => policy,
        }
    }
}

/// Failure of [`RetryPolicy::retry`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Operation failed in a way retrying cannot fix.
    #[error("operation failed permanently: {0}")]
    Fatal(E),

    /// Operation kept failing until attempts or time ran out.
    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

/// Condition never held within the time allotted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (gave up after {attempts} checks in {elapsed:?})")]
pub struct TimeoutError {
    pub message: String,
    pub attempts: u32,
    pub elapsed: Duration,
}
