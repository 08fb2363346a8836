//! Retry and timeout settings for activity execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for failed activity attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    100_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Retries without waiting. Used by tests and tooling.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay before the retry that follows `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Per-workflow activity settings: attempt timeout plus retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Start-to-close timeout for a single attempt
    #[serde(with = "duration_secs", rename = "timeout_seconds")]
    pub start_to_close: Duration,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    /// Per-article pipeline: 5 min per attempt, 5 attempts
    pub fn pipeline() -> Self {
        Self {
            start_to_close: Duration::from_secs(5 * 60),
            retry: RetryPolicy::with_max_attempts(5),
        }
    }

    /// Causal chain processor: 5 min per attempt, 3 attempts
    pub fn causal() -> Self {
        Self {
            start_to_close: Duration::from_secs(5 * 60),
            retry: RetryPolicy::with_max_attempts(3),
        }
    }

    /// Retroactive rebalancer: 2 min per attempt, 3 attempts
    pub fn rebalance() -> Self {
        Self {
            start_to_close: Duration::from_secs(2 * 60),
            retry: RetryPolicy::with_max_attempts(3),
        }
    }

    /// URL discovery in the ingestion cycle: 2 min per attempt
    pub fn discovery() -> Self {
        Self {
            start_to_close: Duration::from_secs(2 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
