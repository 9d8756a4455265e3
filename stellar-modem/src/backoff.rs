//! Exponential backoff for reconnect episodes.

use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Tunables for [`ExponentialBackoff`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the second attempt of an episode.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Growth factor applied after every delay.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Ceiling for a single delay.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Total time an episode may spend retrying before giving up.
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_max_elapsed_secs() -> u64 {
    60
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_secs: default_max_backoff_secs(),
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

impl BackoffConfig {
    /// Reject settings that would retry without delay or shrink delays.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.initial_backoff_ms > 0, "initial_backoff_ms must be positive");
        anyhow::ensure!(
            self.multiplier.is_finite() && self.multiplier >= 1.0,
            "multiplier must be at least 1.0, got {}",
            self.multiplier
        );
        anyhow::ensure!(
            self.max_backoff() >= self.initial_backoff(),
            "max_backoff_secs ({}s) is shorter than initial_backoff_ms ({}ms)",
            self.max_backoff_secs,
            self.initial_backoff_ms
        );
        Ok(())
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_elapsed_secs)
    }
}

/// State of one backoff episode.
///
/// Delays grow by `multiplier` up to `max_backoff`. Once the time since
/// [`reset`](Self::reset) plus the next delay would exceed `max_elapsed`,
/// [`next_backoff`](Self::next_backoff) returns `None`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_backoff();
        Self {
            config,
            current,
            started: Instant::now(),
        }
    }

    /// Start a new episode.
    pub fn reset(&mut self) {
        self.current = self.config.initial_backoff();
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Delay to wait before the next attempt, or `None` when the episode's
    /// budget is spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.current.min(self.config.max_backoff());
        if self.elapsed() + delay > self.config.max_elapsed() {
            return None;
        }

        // Delays never shrink, whatever the configured multiplier.
        let multiplier = if self.config.multiplier.is_finite() {
            self.config.multiplier.max(1.0)
        } else {
            1.0
        };
        let grown = self.current.as_secs_f64() * multiplier;
        let cap = self.config.max_backoff().max(delay).as_secs_f64();
        self.current = Duration::from_secs_f64(grown.min(cap));

        Some(delay)
    }
}
