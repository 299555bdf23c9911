//! Classify-and-backoff wrapper around one external service call.
//!
//! Retry policy is plain data ([`RetryPolicy`]); the executor takes the call
//! as a closure so the same loop serves the real vision service and the
//! in-memory fakes used in tests.
//!
//! ## Schedule
//!
//! `delay = min(max_delay, base_delay * 2^(attempt-1))`, raised to the
//! server's `retry_after` when the error carries one. With the defaults
//! (5 s base, 60 s cap, 3 attempts) a unit waits 5 s then 10 s before it is
//! given up on.

use crate::error::{RetryError, ServiceError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt ceiling and delay bounds for [`RetryExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt `attempt` (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        let scaled = 2u32
            .checked_pow(exp)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay);
        scaled.min(self.max_delay)
    }

    /// Delay to apply after `err` on attempt `attempt`.
    pub fn delay_for(&self, err: &ServiceError, attempt: u32) -> Duration {
        let computed = self.backoff(attempt);
        match err {
            ServiceError::RateLimited {
                retry_after: Some(hint),
            } => computed.max(*hint),
            _ => computed,
        }
    }
}

/// A successful call together with how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Runs a fallible async operation under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `operation` until it succeeds, fails fatally, or the attempt
    /// ceiling is reached.
    ///
    /// The closure receives the 1-indexed attempt number. Only the calling
    /// task sleeps during backoff.
    pub async fn execute<T, F, Fut>(
        &self,
        unit: usize,
        operation: F,
    ) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        self.execute_until(unit, std::future::pending::<()>(), operation)
            .await
    }

    /// Like [`execute`](Self::execute), but gives up with
    /// [`RetryError::Cancelled`] as soon as `cancel` resolves while waiting
    /// out a backoff. An attempt already running is never cut short.
    pub async fn execute_until<T, F, Fut, C>(
        &self,
        unit: usize,
        cancel: C,
        mut operation: F,
    ) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
        C: Future<Output = ()>,
    {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt = 1;
        tokio::pin!(cancel);

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(unit, attempt, "service call succeeded after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) if !error.is_retryable() => {
                    warn!(unit, attempt, error = %error, "service call failed, not retrying");
                    return Err(RetryError::Fatal {
                        attempts: attempt,
                        error,
                    });
                }
                Err(error) if attempt >= max_attempts => {
                    warn!(unit, attempt, error = %error, "service call failed, retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                Err(error) => {
                    let delay = self.policy.delay_for(&error, attempt);
                    warn!(
                        unit,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "service call failed, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = &mut cancel => {
                            debug!(unit, attempt, "backoff cancelled");
                            return Err(RetryError::Cancelled {
                                attempts: attempt,
                                last: error,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

static STATUS_429: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b429\b").unwrap());

static STATUS_5XX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b50[0234]\b").unwrap());

static RETRY_AFTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:retry[- _]after|try again in)\s*:?\s*(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?)?",
    )
    .unwrap()
});

/// Map a transport error message onto the retry taxonomy.
///
/// Providers surface failures as formatted strings; this is the single
/// place those strings are inspected.
pub fn classify(message: &str) -> ServiceError {
    let lower = message.to_lowercase();

    let rate_limited = STATUS_429.is_match(&lower)
        || lower.contains("rate limit")
        || lower.contains("ratelimit")
        || lower.contains("too many requests")
        || lower.contains("quota");
    if rate_limited {
        return ServiceError::RateLimited {
            retry_after: parse_retry_after(&lower),
        };
    }

    let transient = STATUS_5XX.is_match(&lower)
        || [
            "timeout",
            "timed out",
            "connection",
            "reset by peer",
            "broken pipe",
            "overloaded",
            "unavailable",
            "temporarily",
        ]
        .iter()
        .any(|needle| lower.contains(needle));
    if transient {
        return ServiceError::Transient {
            cause: message.to_string(),
        };
    }

    ServiceError::Fatal {
        cause: message.to_string(),
    }
}

fn parse_retry_after(message: &str) -> Option<Duration> {
    let caps = RETRY_AFTER.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let in_millis = caps
        .get(2)
        .map(|unit| unit.as_str().starts_with("ms") || unit.as_str().starts_with("milli"))
        .unwrap_or(false);
    Some(if in_millis {
        Duration::from_secs_f64(value / 1000.0)
    } else {
        Duration::from_secs_f64(value)
    })
}
