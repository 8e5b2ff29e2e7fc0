//! Background runtime
//!
//! Drives the engine from the scheduler: a dispatch loop takes due calls and
//! runs them with bounded concurrency, and a sweep loop periodically runs
//! recovery.

mod poller;
mod pool;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::recovery::RecoveryConfig;
use crate::scheduler::SchedulerError;

pub use pool::{RuntimeStatus, WorkflowRuntime};

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Poll interval while calls are due
    #[serde(with = "crate::serde_helpers::duration_millis")]
    pub poll_interval: Duration,

    /// Upper bound the poll interval backs off to while idle
    #[serde(with = "crate::serde_helpers::duration_millis")]
    pub max_poll_interval: Duration,

    /// Maximum calls taken per poll
    pub batch_size: usize,

    /// Maximum calls dispatched concurrently
    pub max_concurrency: usize,

    /// Graceful shutdown timeout
    #[serde(with = "crate::serde_helpers::duration_millis")]
    pub shutdown_timeout: Duration,

    /// Recovery sweep settings
    pub recovery: RecoveryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(1),
            batch_size: 32,
            max_concurrency: 16,
            shutdown_timeout: Duration::from_secs(30),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Create config from environment variables
    ///
    /// - `REPLAY_POLL_INTERVAL_MS`
    /// - `REPLAY_BATCH_SIZE`
    /// - `REPLAY_MAX_CONCURRENCY`
    /// - plus the [`RecoveryConfig::from_env`] variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let poll_interval = std::env::var("REPLAY_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        Self {
            poll_interval,
            max_poll_interval: defaults.max_poll_interval.max(poll_interval),
            batch_size: std::env::var("REPLAY_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.batch_size)
                .max(1),
            max_concurrency: std::env::var("REPLAY_MAX_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_concurrency)
                .max(1),
            recovery: RecoveryConfig::from_env(),
            ..defaults
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.max_poll_interval = self.max_poll_interval.max(interval);
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval.max(self.poll_interval);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}

/// Runtime errors
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Engine error
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Scheduler error
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Runtime already running
    #[error("runtime is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {0} calls in flight")]
    ShutdownTimeout(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = RuntimeConfig::default()
            .with_poll_interval(Duration::from_secs(2))
            .with_batch_size(0)
            .with_max_concurrency(0);

        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_poll_interval, Duration::from_secs(2));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn test_config_serializes_millis() {
        let json = serde_json::to_value(RuntimeConfig::default()).unwrap();
        assert_eq!(json["poll_interval"], 100);
        assert_eq!(json["recovery"]["sweep_interval"], 600_000);

        let back: RuntimeConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, RuntimeConfig::default());
    }
}
