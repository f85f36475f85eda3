//! Reconnect backoff policy.
//!
//! Probes behind NAT reconnect to the coordinator on any stream failure;
//! the delay between attempts grows exponentially and resets once a
//! registration succeeds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff configuration for stream reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound on the retry delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Multiplier applied after each failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

const fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

/// Stateful reconnect backoff built from a [`BackoffConfig`].
///
/// `next_delay` returns the delay to sleep before the upcoming attempt
/// and advances the state; `reset` is called after a successful
/// registration so the next outage starts from the initial delay again.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    current: Duration,
}

impl ReconnectBackoff {
    /// Create a backoff starting at the configured initial delay.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current }
    }

    /// Delay to apply before the next attempt; doubles (by the
    /// configured multiplier) up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.as_secs_f64() * self.config.multiplier;
        self.current = Duration::from_secs_f64(next).min(self.config.max_delay);
        delay
    }

    /// Reset to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
