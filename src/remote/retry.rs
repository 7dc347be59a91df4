//! Retry policy for transient remote failures.
//!
//! Backoff grows geometrically from `initial_backoff` by `multiplier`,
//! capped at `max_backoff`. A rate limit's retry-after hint is a floor for
//! the next delay.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::client::RemoteResult;

/// Default number of attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

/// Default upper bound for a single delay.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed, including the first. Always at least one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound for a computed delay.
    pub max_backoff: Duration,
}

/// Final outcome of a retried operation.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Last result observed.
    pub result: RemoteResult<T>,
    /// Number of attempts made.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_attempts: u32, initial_backoff: Duration, multiplier: f64, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            multiplier,
            max_backoff,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1 for the first retry).
    ///
    /// `hint_secs` is the remote's retry-after, honoured as a lower bound.
    #[must_use]
    pub fn delay(&self, retry: u32, hint_secs: Option<u64>) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent).min(f64::MAX);
        let computed = Duration::try_from_secs_f64(self.initial_backoff.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_backoff);

        match hint_secs {
            Some(secs) => computed.max(Duration::from_secs(secs)),
            None => computed,
        }
    }

    /// Runs `operation` until it succeeds, fails permanently, or the attempt
    /// budget is spent.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = operation().await;

            let error = match &result {
                Err(e) if e.is_transient() => e,
                _ => return Attempted { result, attempts },
            };

            if attempts >= self.max_attempts {
                warn!("{label}: giving up after {attempts} attempts: {error}");
                return Attempted { result, attempts };
            }

            let wait = self.delay(attempts, error.retry_after_secs());
            debug!("{label}: attempt {attempts} failed ({error}), retrying in {wait:?}");
            tokio::time::sleep(wait).await;
        }
    }
}
