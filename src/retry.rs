//! Retry backoff policies.
//!
//! A policy is a finite, non-decreasing table of delays plus a jitter
//! fraction. Policies are immutable and cheap to clone, so one instance can
//! be shared by every worker on a client.

use std::time::Duration;

use rand::Rng;

use crate::errors::{Error, Result};

/// Maps an attempt number to a backoff delay.
///
/// `delay(n)` returns the `n`th table entry (the last entry for attempts
/// past the end of the table) scaled by `1 ± jitter·U(0,1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    intervals: Vec<Duration>,
    jitter: f64,
}

impl Default for RetryPolicy {
    /// Geometric backoff: 500 ms doubling per attempt, capped at 5 minutes,
    /// with 50% jitter.
    fn default() -> Self {
        let mut intervals = Vec::with_capacity(12);
        let mut interval = Duration::from_millis(500);
        let cap = Duration::from_secs(300);
        for _ in 0..12 {
            intervals.push(interval.min(cap));
            interval *= 2;
        }
        Self {
            intervals,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy from an explicit delay table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRetryPolicy`] if the table is empty or not
    /// non-decreasing. Jitter is clamped to `[0.0, 1.0)`.
    pub fn new(intervals: Vec<Duration>, jitter: f64) -> Result<Self> {
        if intervals.is_empty() {
            return Err(Error::InvalidRetryPolicy(
                "interval table may not be empty".to_string(),
            ));
        }
        if intervals.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(Error::InvalidRetryPolicy(
                "interval table must be non-decreasing".to_string(),
            ));
        }

        Ok(Self {
            intervals,
            jitter: jitter.clamp(0.0, 0.999),
        })
    }

    /// 20 evenly spaced steps up to 60 seconds, 50% jitter.
    #[must_use]
    pub fn linear_one_minute() -> Self {
        Self {
            intervals: linear_steps(20, Duration::from_secs(60)),
            jitter: 0.5,
        }
    }

    /// 20 evenly spaced steps up to 10 minutes, 50% jitter.
    #[must_use]
    pub fn linear_ten_minutes() -> Self {
        Self {
            intervals: linear_steps(20, Duration::from_secs(600)),
            jitter: 0.5,
        }
    }

    /// A single fixed delay with no jitter. Deterministic, mainly for tests.
    #[must_use]
    pub fn constant(delay: Duration) -> Self {
        Self {
            intervals: vec![delay],
            jitter: 0.0,
        }
    }

    /// Returns the jittered delay for the given attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.delay_without_jitter(attempt);
        if self.jitter == 0.0 {
            return base;
        }

        let mut rng = rand::thread_rng();
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        base.mul_f64(factor)
    }

    /// Returns the table delay for the given attempt without jitter.
    #[must_use]
    pub fn delay_without_jitter(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.intervals.len() - 1);
        self.intervals[idx]
    }

    /// Number of entries in the delay table.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.intervals.len()
    }

    /// The configured jitter fraction.
    #[must_use]
    pub const fn jitter(&self) -> f64 {
        self.jitter
    }
}

/// Builds `steps` evenly spaced delays ending at `max`.
fn linear_steps(steps: u32, max: Duration) -> Vec<Duration> {
    (1..=steps)
        .map(|i| max.mul_f64(f64::from(i) / f64::from(steps)))
        .collect()
}
