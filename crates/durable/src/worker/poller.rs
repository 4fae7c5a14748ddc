//! Polling with exponential backoff
//!
//! Shared by the activity worker pool and the scheduler: poll fast while
//! there is work, back off towards `max_interval` while idle.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::{env_millis_or, env_or};
use crate::reliability::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when work is available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when nothing was found
    pub backoff_multiplier: f64,

    /// Maximum items to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `{prefix}POLL_MIN_MS`, `{prefix}POLL_MAX_MS` and `{prefix}BATCH_SIZE`
    ///
    /// `prefix` distinguishes the scheduler (`SCHEDULER_`) from workers
    /// (`WORKER_`); the global `STEADFAST_` prefix is added by the helpers.
    pub fn from_env(prefix: &str) -> Self {
        let defaults = Self::default();
        Self {
            min_interval: env_millis_or(&format!("{prefix}POLL_MIN_MS"), defaults.min_interval),
            max_interval: env_millis_or(&format!("{prefix}POLL_MAX_MS"), defaults.max_interval),
            backoff_multiplier: defaults.backoff_multiplier,
            batch_size: env_or(&format!("{prefix}BATCH_SIZE"), defaults.batch_size).max(1),
        }
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

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Poll interval tracker with shutdown-aware waiting
///
/// Call [`Poller::record`] with the number of items each poll found, then
/// [`Poller::wait`] before the next poll.
pub struct Poller {
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Poller {
    pub fn new(config: PollerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Update the backoff after a poll that found `found` items
    pub fn record(&mut self, found: usize) {
        if found == 0 {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "nothing found, backing off"
            );
        } else {
            self.reset_backoff();
        }
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled.
    pub async fn wait(&mut self) -> bool {
        if self.is_shutdown() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = self.shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    /// Items to claim this round given `capacity` free slots
    pub fn batch(&self, capacity: usize) -> usize {
        capacity.min(self.config.batch_size)
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::try_from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier.max(1.0),
        )
        .unwrap_or(self.config.max_interval);
        self.current_interval = next.min(self.config.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(10))
            .with_backoff_multiplier(0.5)
            .with_batch_size(0);

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(300))
            .with_backoff_multiplier(2.0);
        let mut poller = Poller::new(config, rx);

        poller.record(0);
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        poller.record(0);
        assert_eq!(poller.current_interval(), Duration::from_millis(300));

        poller.record(3);
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_saturates_at_unbounded_max() {
        let (_tx, rx) = watch::channel(false);
        let mut config = PollerConfig::new()
            .with_min_interval(Duration::MAX)
            .with_max_interval(Duration::MAX);
        config.backoff_multiplier = -4.0;
        let mut poller = Poller::new(config, rx);

        poller.record(0);
        assert_eq!(poller.current_interval(), Duration::MAX);
    }

    #[test]
    fn test_batch_is_capped() {
        let (_tx, rx) = watch::channel(false);
        let poller = Poller::new(PollerConfig::new().with_batch_size(4), rx);

        assert_eq!(poller.batch(10), 4);
        assert_eq!(poller.batch(2), 2);
    }

    #[tokio::test]
    async fn test_wait_returns_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let mut poller = Poller::new(
            PollerConfig::new().with_min_interval(Duration::from_secs(60)),
            rx,
        );

        tx.send(true).unwrap();
        assert!(poller.wait().await);
    }
}
