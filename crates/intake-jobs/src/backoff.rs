//! Retry policy for failed jobs.

use std::time::Duration;

use intake_core::defaults::{JOB_BACKOFF_BASE_SECS, JOB_BACKOFF_CAP_SECS, JOB_MAX_ATTEMPTS};

/// When and how often a failing job is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a retryable failure becomes permanent.
    pub max_attempts: i32,
    /// Delay unit; the first retry after attempt `n` waits `base * 2^n`.
    pub base: Duration,
    /// Upper bound for a single delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: JOB_MAX_ATTEMPTS,
            base: Duration::from_secs(JOB_BACKOFF_BASE_SECS),
            cap: Duration::from_secs(JOB_BACKOFF_CAP_SECS),
        }
    }
}

impl RetryPolicy {
    /// Read the policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_MAX_ATTEMPTS` | `5` | Attempts before permanent failure |
    /// | `JOB_BACKOFF_BASE_SECS` | `30` | Backoff base delay |
    /// | `JOB_BACKOFF_CAP_SECS` | `3600` | Backoff ceiling |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_attempts = std::env::var("JOB_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults.max_attempts)
            .max(1);

        let base = std::env::var("JOB_BACKOFF_BASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.base);

        let cap = std::env::var("JOB_BACKOFF_CAP_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.cap);

        Self {
            max_attempts,
            base,
            cap,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Delay before the next attempt of a job that has run `attempts` times.
    ///
    /// `min(base * 2^attempts, cap)`. Pure and non-decreasing in `attempts`.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exp = u32::try_from(attempts.max(0)).unwrap_or(0);
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Whether a job that has run `attempts` times may run again.
    pub fn should_retry(&self, attempts: i32) -> bool {
        attempts < self.max_attempts
    }
}
