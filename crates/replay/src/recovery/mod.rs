//! Recovery of abandoned executions
//!
//! An invocation that crashes leaves its workflow marked executing with a
//! heartbeat that stops advancing. The sweeper finds such workflows, bumps
//! their generation so any straggler from the dead invocation is fenced off,
//! and schedules a fresh resume.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::engine::{EngineError, WorkflowEngine};
use crate::persistence::WorkflowStore;
use crate::scheduler::{ScheduledCall, Scheduler};

/// Recovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// How often the sweep runs
    #[serde(with = "crate::serde_helpers::duration_millis")]
    pub sweep_interval: Duration,

    /// Heartbeat age after which an execution is considered dead
    #[serde(with = "crate::serde_helpers::duration_millis")]
    pub dead_threshold: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(600),
            dead_threshold: Duration::from_secs(600),
        }
    }
}

impl RecoveryConfig {
    /// Create config from environment variables
    ///
    /// - `REPLAY_SWEEP_INTERVAL_MS`
    /// - `REPLAY_DEAD_THRESHOLD_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sweep_interval: std::env::var("REPLAY_SWEEP_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval)
                .max(Duration::from_millis(1)),
            dead_threshold: std::env::var("REPLAY_DEAD_THRESHOLD_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.dead_threshold),
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_dead_threshold(mut self, threshold: Duration) -> Self {
        self.dead_threshold = threshold;
        self
    }
}

/// Reclaims workflows whose execution stopped heartbeating
pub struct RecoverySweeper {
    store: Arc<dyn WorkflowStore>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
}

impl RecoverySweeper {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            clock,
            config,
        }
    }

    /// Share the engine's store, scheduler and clock
    pub fn for_engine(engine: &WorkflowEngine, config: RecoveryConfig) -> Self {
        Self::new(
            Arc::clone(engine.store()),
            Arc::clone(engine.scheduler()),
            Arc::clone(engine.clock()),
            config,
        )
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run one sweep and return the ids of reclaimed workflows
    ///
    /// A workflow that changed generation between the query and the reclaim
    /// is skipped; another sweeper or a fresh invocation got there first.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<Vec<Uuid>, EngineError> {
        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(self.config.dead_threshold)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = now - threshold;

        let stale = self.store.find_stale_workflows(cutoff).await?;
        let mut reclaimed = Vec::with_capacity(stale.len());

        for record in stale {
            if record.is_completed() {
                continue;
            }
            if record.sleeping_until.is_some_and(|until| until > now) {
                debug!(workflow_id = %record.id, "skipping sleeping workflow");
                continue;
            }

            let updated = match self
                .store
                .reclaim_workflow(record.id, record.generation, now)
                .await
            {
                Ok(updated) => updated,
                Err(err) if err.is_fencing() => {
                    debug!(workflow_id = %record.id, %err, "workflow moved on, not reclaiming");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            self.scheduler
                .schedule(
                    now,
                    ScheduledCall::Resume {
                        workflow_id: updated.id,
                        generation: updated.generation,
                    },
                )
                .await?;

            warn!(
                workflow_id = %updated.id,
                generation = updated.generation,
                last_heartbeat = %record.last_heartbeat,
                "reclaimed dead execution"
            );
            reclaimed.push(updated.id);
        }

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "recovery sweep reclaimed workflows");
        }
        Ok(reclaimed)
    }
}
