//! Bounded retry with exponential backoff.
//!
//! A [`RetryPolicy`] is a plain value injected into the batch processor. Each call is
//! attempted at most `max_attempts` times. After failed attempt `n` the task sleeps for
//! `base_delay * multiplier^n`, capped at `max_delay` and optionally jittered. Errors
//! that [`StoreError::is_retryable`] rejects end the loop immediately.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::store::StoreError;

/// Retry policy for store calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one (at least 1).
    pub max_attempts: u32,
    /// Scale of every delay.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
    /// Randomize each delay within `[0, delay)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2,
            jitter: true,
        }
    }
}

/// Result of running an operation under a policy.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result.
    pub result: Result<T, StoreError>,
    /// Attempts made.
    pub attempts: u32,
}

impl RetryPolicy {
    /// Policy with `max_attempts` and default backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Policy that retries without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1,
            jitter: false,
        }
    }

    /// Load from environment variables with production defaults.
    ///
    /// - `REASSEMBLY_RETRY_MAX_ATTEMPTS` (default: 3)
    /// - `REASSEMBLY_RETRY_BASE_DELAY_MS` (default: 100)
    /// - `REASSEMBLY_RETRY_MAX_DELAY_MS` (default: 5000)
    /// - `REASSEMBLY_RETRY_JITTER` (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: std::env::var("REASSEMBLY_RETRY_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(defaults.max_attempts)
                .max(1),
            base_delay: std::env::var("REASSEMBLY_RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: std::env::var("REASSEMBLY_RETRY_MAX_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            multiplier: defaults.multiplier,
            jitter: std::env::var("REASSEMBLY_RETRY_JITTER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.jitter),
        }
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the delay scale.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    fn schedule(&self) -> ExponentialBackoff {
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        ExponentialBackoff::from_millis(u64::from(self.multiplier.max(1)))
            .factor(base_ms)
            .max_delay(self.max_delay)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.schedule()
            .nth(attempt.saturating_sub(1) as usize)
            .unwrap_or(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. `label` tags the log lines.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let delays: Vec<Duration> = self
            .schedule()
            .take(max_attempts as usize - 1)
            .map(|delay| if self.jitter { jitter(delay) } else { delay })
            .collect();

        let attempts = AtomicU32::new(0);
        let result = RetryIf::spawn(
            delays,
            || op(attempts.fetch_add(1, Ordering::SeqCst) + 1),
            |error: &StoreError| {
                let attempt = attempts.load(Ordering::SeqCst);
                let retry = error.is_retryable() && attempt < max_attempts;
                if retry {
                    debug!(label, attempt, max_attempts, error = %error, "retryable store error");
                } else if error.is_retryable() {
                    warn!(label, attempts = attempt, error = %error, "retry budget exhausted");
                }
                retry
            },
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        if result.is_ok() && attempts > 1 {
            debug!(label, attempt = attempts, "store call succeeded after retry");
        }
        Attempted { result, attempts }
    }
}
