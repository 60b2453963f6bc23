//! Claim polling with exponential backoff
//!
//! A dispatch slot that finds nothing claimable sleeps instead of spinning. The
//! interval grows while the queue stays empty and snaps back to the minimum as
//! soon as a claim succeeds.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (right after a successful claim)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when nothing was claimable
    pub backoff_multiplier: f64,

    /// Random spread added to each wait, as a fraction of the interval
    pub jitter: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            jitter: 0.1,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set jitter fraction (0.0 disables jitter)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

/// Per-slot poll state
pub struct ClaimPoller {
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ClaimPoller {
    /// Create a new claim poller
    pub fn new(config: PollerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Record whether the last claim attempt found a job
    pub fn record(&mut self, claimed: bool) {
        if claimed {
            self.reset_backoff();
        } else {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "Nothing claimable, backing off"
            );
        }
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled during (or before) the wait.
    pub async fn wait(&mut self) -> bool {
        if self.is_shutdown() {
            return true;
        }

        let interval = self.jittered(self.current_interval);
        tokio::select! {
            _ = tokio::time::sleep(interval) => self.is_shutdown(),
            _ = self.shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn jittered(&self, interval: Duration) -> Duration {
        if self.config.jitter <= 0.0 {
            return interval;
        }
        let spread = interval.as_secs_f64() * self.config.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        interval + Duration::from_secs_f64(extra)
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}
