//! Work queue configuration.
//!
//! A [`Queue`] is a value object describing a named channel of task
//! references: how many leases a client may hold at once, how many attempts
//! a task gets by default, and how long a single attempt may run before its
//! lease lapses.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Name of the queue used when none is configured.
pub const DEFAULT_QUEUE: &str = "DEFAULT";

/// Configuration for a named work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    /// Queue name. Tasks reference it and the storage adapter namespaces
    /// its message stream by it.
    pub name: String,

    /// Maximum concurrent leases held by a single client instance. Also
    /// sizes the client's worker pool.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Default attempt limit for tasks that do not carry their own.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Lease duration for one attempt. The scheduler extends the lease at
    /// half this interval while a handler runs, and the attempt is cut off
    /// once the full interval elapses.
    #[serde(default = "default_max_run_time", with = "duration_secs")]
    pub max_run_time: Duration,

    /// How long a poll for new work blocks before returning empty.
    #[serde(default = "default_poll_timeout", with = "duration_secs")]
    pub poll_timeout: Duration,
}

const fn default_max_concurrency() -> usize {
    10
}

const fn default_max_tries() -> u32 {
    100
}

const fn default_max_run_time() -> Duration {
    Duration::from_secs(60)
}

const fn default_poll_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for Queue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
    }
}

impl Queue {
    /// Creates a queue with the given name and default settings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_concurrency: default_max_concurrency(),
            max_tries: default_max_tries(),
            max_run_time: default_max_run_time(),
            poll_timeout: default_poll_timeout(),
        }
    }

    /// Sets the per-client lease limit.
    #[must_use]
    pub const fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the default attempt limit.
    #[must_use]
    pub const fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Sets the per-attempt lease duration.
    #[must_use]
    pub const fn with_max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = max_run_time;
        self
    }

    /// Sets the blocking poll timeout.
    #[must_use]
    pub const fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidQueue`] for an empty name or zero limits.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidQueue("name may not be empty".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::InvalidQueue(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_tries == 0 {
            return Err(Error::InvalidQueue(
                "max_tries must be at least 1".to_string(),
            ));
        }
        if self.max_run_time.is_zero() {
            return Err(Error::InvalidQueue(
                "max_run_time must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time statistics for a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    /// Queue name.
    pub name: String,
    /// Messages ready for delivery.
    pub depth: u64,
    /// Messages currently leased to consumers.
    pub in_flight: u64,
    /// Messages waiting out a redelivery delay.
    pub scheduled: u64,
    /// The queue configuration the adapter holds.
    pub config: Queue,
}

/// Serde helper storing durations as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
