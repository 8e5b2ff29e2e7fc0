//! Due-call polling with exponential backoff
//!
//! The interval grows while the scheduler has nothing due and snaps back to
//! the minimum as soon as a poll returns work.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::clock::Clock;
use crate::scheduler::{DueCall, Scheduler, SchedulerError};

pub(crate) struct CallPoller {
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    min_interval: Duration,
    max_interval: Duration,
    backoff_multiplier: f64,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl CallPoller {
    pub(crate) fn new(
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
        min_interval: Duration,
        max_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            scheduler,
            clock,
            batch_size: batch_size.max(1),
            min_interval,
            max_interval: max_interval.max(min_interval),
            backoff_multiplier: 1.5,
            current_interval: min_interval,
            shutdown_rx,
        }
    }

    /// Take up to `max_calls` due calls
    #[instrument(skip(self))]
    pub(crate) async fn poll(&mut self, max_calls: usize) -> Result<Vec<DueCall>, SchedulerError> {
        if self.is_shutdown() {
            return Ok(vec![]);
        }

        let limit = max_calls.min(self.batch_size);
        let due = self.scheduler.take_due(self.clock.now(), limit).await?;

        if due.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "nothing due, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = due.len(), "took due calls");
        }

        Ok(due)
    }

    /// Sleep for the current interval; true if shutdown was signalled
    pub(crate) async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub(crate) fn current_interval(&self) -> Duration {
        self.current_interval
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.backoff_multiplier,
        );
        self.current_interval = next.min(self.max_interval);
    }
}
