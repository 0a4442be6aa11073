//! Bounded retry for remote calls.
//!
//! Only [`RemoteError::Transient`] failures are retried; a permanent
//! failure ends the call after the attempt that raised it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::RemoteError;

/// Backoff strategy for retry waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// wait = base
    #[default]
    Constant,
    /// wait = base * retry
    Linear,
    /// wait = base * 2^(retry - 1)
    Exponential,
}

/// Jitter applied on top of the backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to wait
    Full,
    /// Half fixed, half random
    Equal,
}

/// Result of a retried call together with the number of attempts made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome<T> {
    /// Final result.
    pub result: Result<T, RemoteError>,
    /// Attempts made, at least 1.
    pub attempts: u32,
}

/// Per-call retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    wait: Duration,
    max_wait: Duration,
    backoff: BackoffStrategy,
    jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    /// Creates a constant-wait policy without jitter.
    #[must_use]
    pub fn new(max_retries: u32, wait: Duration) -> Self {
        Self {
            max_retries,
            wait,
            max_wait: Duration::from_secs(60),
            backoff: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Caps any single wait.
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Retries allowed after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts allowed per call.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before the `retry`-th retry (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let delay = match self.backoff {
            BackoffStrategy::Constant => self.wait,
            BackoffStrategy::Linear => self.wait.saturating_mul(retry),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(retry - 1);
                self.wait.saturating_mul(factor)
            }
        }
        .min(self.max_wait);

        match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay.is_zero() {
                    delay
                } else {
                    delay.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half.is_zero() {
                    delay
                } else {
                    half + half.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
                }
            }
        }
    }

    /// Runs `operation` until it succeeds, fails permanently, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> CallOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(call = label, attempts, "Remote call succeeded after retry");
                    }
                    return CallOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(err) if err.is_retryable() && attempts <= self.max_retries => {
                    let delay = self.delay_for(attempts);
                    warn!(
                        call = label,
                        attempt = attempts,
                        max_attempts = self.max_attempts(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return CallOutcome {
                        result: Err(err),
                        attempts,
                    };
                }
            }
        }
    }
}
