//! Workflow engine
//!
//! An invocation races three futures: the step executor serving the
//! handler's requests, the handler itself, and a heartbeat loop. Whichever
//! finishes first decides how the invocation ends.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::registry::{ActivityRegistry, WorkflowRegistry};
use super::replayer::{validate_journal, StepExecutor, Suspension};
use super::EngineError;
use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::channel::Channel;
use crate::clock::{Clock, SystemClock};
use crate::persistence::{StoreError, WorkflowState, WorkflowStore};
use crate::reliability::RetryPolicy;
use crate::scheduler::{ScheduledCall, Scheduler};
use crate::workflow::{
    FunctionType, JournalEntry, Outcome, Step, StepContext, StepRequest, StepType, Workflow,
    WorkflowError,
};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often a running invocation refreshes its heartbeat
    #[serde(with = "crate::serde_helpers::duration_millis")]
    pub heartbeat_interval: Duration,

    /// Upper bound on journal length; recording past it aborts the invocation
    pub max_journal_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            max_journal_entries: 10_000,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables
    ///
    /// - `REPLAY_HEARTBEAT_INTERVAL_MS`
    /// - `REPLAY_MAX_JOURNAL_ENTRIES`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_interval: std::env::var("REPLAY_HEARTBEAT_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval)
                .max(Duration::from_millis(1)),
            max_journal_entries: std::env::var("REPLAY_MAX_JOURNAL_ENTRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_journal_entries),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_journal_entries(mut self, max: usize) -> Self {
        self.max_journal_entries = max;
        self
    }
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// The handler returned and the workflow is now completed
    Completed(Outcome),

    /// The workflow had already completed; nothing ran
    AlreadyCompleted,

    /// Suspended until the given instant
    Sleeping { until: DateTime<Utc> },

    /// Suspended waiting for the activity recorded at `step_number`
    AwaitingActivity { step_number: u32 },

    /// An activity step is still in progress; the handler did not run
    Blocked { step_number: u32 },
}

enum Race {
    Executor(Result<Suspension, EngineError>),
    Handler(Result<Value, WorkflowError>),
    Heartbeat(EngineError),
}

/// Durable workflow engine
///
/// Every entry point is keyed by `(workflow_id, generation)`. A call carrying
/// a stale generation is rejected by the store, so at most one invocation of
/// a workflow makes progress at a time.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            store,
            scheduler,
            clock: Arc::new(SystemClock),
            workflows: WorkflowRegistry::new(),
            activities: ActivityRegistry::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the wall clock (tests drive time with [`crate::ManualClock`])
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register_workflow<W: Workflow>(&mut self, workflow: W) -> &mut Self {
        self.workflows.register(workflow);
        self
    }

    pub fn register_workflow_fn<F, Fut>(
        &mut self,
        workflow_type: impl Into<String>,
        f: F,
    ) -> &mut Self
    where
        F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        self.workflows.register_fn(workflow_type, f);
        self
    }

    pub fn register_activity<A: Activity>(&mut self, activity: A) -> &mut Self {
        self.activities.register(activity);
        self
    }

    pub fn register_activity_with_retry<A: Activity>(
        &mut self,
        activity: A,
        retry_policy: RetryPolicy,
    ) -> &mut Self {
        self.activities.register_with_retry(activity, retry_policy);
        self
    }

    pub fn register_activity_fn<F, Fut>(
        &mut self,
        activity_type: impl Into<String>,
        retry_policy: RetryPolicy,
        f: F,
    ) -> &mut Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        self.activities.register_fn(activity_type, retry_policy, f);
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    pub fn activities(&self) -> &ActivityRegistry {
        &self.activities
    }

    // =========================================================================
    // Client API
    // =========================================================================

    /// Create a workflow and schedule its first invocation
    #[instrument(skip(self, args))]
    pub async fn start(&self, workflow_type: &str, args: Value) -> Result<Uuid, EngineError> {
        self.workflows.get(workflow_type)?;

        let workflow_id = Uuid::now_v7();
        let now = self.clock.now();
        self.store
            .create_workflow(workflow_id, workflow_type, args, now)
            .await?;
        self.scheduler
            .schedule(
                now,
                ScheduledCall::Resume {
                    workflow_id,
                    generation: 0,
                },
            )
            .await?;

        info!(%workflow_id, workflow_type, "workflow started");
        Ok(workflow_id)
    }

    /// Start a typed workflow
    pub async fn start_workflow<W: Workflow>(&self, input: &W::Input) -> Result<Uuid, EngineError> {
        let args = serde_json::to_value(input)?;
        self.start(W::TYPE, args).await
    }

    /// Current lifecycle state of a workflow
    pub async fn status(&self, workflow_id: Uuid) -> Result<WorkflowState, EngineError> {
        Ok(self.store.get_workflow(workflow_id).await?.state)
    }

    /// Journal of a workflow as of its current generation
    pub async fn journal(&self, workflow_id: Uuid) -> Result<Vec<JournalEntry>, EngineError> {
        let record = self.store.get_workflow(workflow_id).await?;
        Ok(self
            .store
            .load_journal(workflow_id, record.generation)
            .await?)
    }

    // =========================================================================
    // Scheduled entry points
    // =========================================================================

    /// Execute a due scheduled call
    pub async fn dispatch(&self, call: ScheduledCall) -> Result<(), EngineError> {
        match call {
            ScheduledCall::Resume {
                workflow_id,
                generation,
            } => self.resume(workflow_id, generation).await.map(|_| ()),
            ScheduledCall::RunActivity {
                workflow_id,
                generation,
                step_number,
                activity_type,
                input,
                attempt,
            } => {
                self.run_activity(
                    workflow_id,
                    generation,
                    step_number,
                    &activity_type,
                    input,
                    attempt,
                )
                .await
            }
        }
    }

    /// Run one invocation of the workflow
    #[instrument(skip(self), fields(%workflow_id, generation))]
    pub async fn resume(
        &self,
        workflow_id: Uuid,
        generation: u64,
    ) -> Result<Invocation, EngineError> {
        let record = self.store.get_workflow(workflow_id).await?;
        record.check_generation(generation)?;
        if record.is_completed() {
            debug!("workflow already completed");
            return Ok(Invocation::AlreadyCompleted);
        }

        if let Some(entry) = self.store.blocked_by(workflow_id).await? {
            if let Step::Function {
                function_type: FunctionType::Activity,
                in_progress: true,
                handle,
                args,
                ..
            } = entry.step
            {
                debug!(step_number = entry.step_number, "blocked on in-progress activity");
                // the handoff's RunActivity may never have been scheduled
                if !record.executing {
                    self.scheduler
                        .schedule(
                            self.clock.now(),
                            ScheduledCall::RunActivity {
                                workflow_id,
                                generation,
                                step_number: entry.step_number,
                                activity_type: handle,
                                input: args,
                                attempt: 1,
                            },
                        )
                        .await?;
                }
                return Ok(Invocation::Blocked {
                    step_number: entry.step_number,
                });
            }
        }

        let handler = self.workflows.get(&record.workflow_type)?;

        let now = self.clock.now();
        let record = self
            .store
            .start_workflow(workflow_id, generation, now)
            .await?;
        if record.is_completed() {
            return Ok(Invocation::AlreadyCompleted);
        }

        // start only keeps a deadline that is still ahead
        if let Some(until) = record.sleeping_until {
            debug!(%until, "resumed before wake-up, sleeping again");
            self.suspend_for_sleep(workflow_id, generation, until)
                .await?;
            return Ok(Invocation::Sleeping { until });
        }

        let journal = self.store.load_journal(workflow_id, generation).await?;
        validate_journal(&journal)?;
        debug!(entries = journal.len(), "replaying journal");

        let channel: Channel<StepRequest, EngineError> = Channel::new(0);
        let step = StepContext::new(workflow_id, generation, channel.clone());
        let mut executor = StepExecutor::new(
            &record,
            now,
            self.store.as_ref(),
            self.clock.as_ref(),
            journal,
            self.config.max_journal_entries,
            channel.clone(),
        );

        let race = tokio::select! {
            biased;
            result = executor.run() => Race::Executor(result),
            result = handler(step.clone(), record.args.clone()) => Race::Handler(result),
            err = self.heartbeat_loop(workflow_id, generation, &channel) => Race::Heartbeat(err),
        };
        drop(executor);
        let _ = channel.close(true);

        match race {
            Race::Handler(result) => {
                if step.is_interrupted() {
                    warn!("handler returned after an interrupted step");
                    return Err(EngineError::Interrupted(
                        "handler returned after an interrupted step".to_string(),
                    ));
                }

                let outcome = match result {
                    Ok(value) => Outcome::success(value),
                    Err(err) => Outcome::error(err.message),
                };
                self.store
                    .complete_workflow(workflow_id, generation, outcome.clone(), self.clock.now())
                    .await?;
                info!(success = outcome.is_success(), "workflow completed");
                Ok(Invocation::Completed(outcome))
            }
            Race::Executor(Ok(Suspension::Sleep {
                step_number,
                deadline,
                remaining,
            })) => {
                self.suspend_for_sleep(workflow_id, generation, deadline)
                    .await?;
                info!(step_number, ?remaining, until = %deadline, "workflow sleeping");
                Ok(Invocation::Sleeping { until: deadline })
            }
            Race::Executor(Ok(Suspension::Activity {
                step_number,
                activity_type,
                input,
            })) => {
                self.suspend_for_activity(workflow_id, generation, step_number, activity_type, input)
                    .await?;
                info!(step_number, "workflow awaiting activity");
                Ok(Invocation::AwaitingActivity { step_number })
            }
            Race::Executor(Err(err)) => {
                if err.is_fencing() {
                    warn!(%err, "invocation fenced off");
                } else {
                    error!(%err, "invocation aborted");
                }
                Err(err)
            }
            Race::Heartbeat(err) => {
                warn!(%err, "heartbeat failed, abandoning invocation");
                Err(err)
            }
        }
    }

    /// Execute one attempt of an activity step
    ///
    /// Success or a final failure completes the journal entry and schedules
    /// a resume. A retryable failure reschedules the attempt instead.
    #[instrument(skip(self, input), fields(%workflow_id, generation, step_number, activity_type, attempt))]
    pub async fn run_activity(
        &self,
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
        activity_type: &str,
        input: Value,
        attempt: u32,
    ) -> Result<(), EngineError> {
        match self.store.blocked_by(workflow_id).await? {
            Some(entry) if entry.step_number == step_number && is_activity(&entry.step) => {}
            _ => {
                return self
                    .resume_after_activity(workflow_id, generation, step_number)
                    .await
            }
        }

        let activity = match self.activities.get(activity_type) {
            Ok(activity) => activity,
            Err(err) => {
                warn!(%err, "recording unknown activity as failed");
                return self
                    .complete_activity(
                        workflow_id,
                        generation,
                        step_number,
                        Outcome::error(err.to_string()),
                    )
                    .await;
            }
        };

        let ctx = ActivityContext::new(
            workflow_id,
            generation,
            step_number,
            attempt,
            activity.retry_policy.max_attempts,
        );
        let outcome = match (activity.handler)(ctx, input.clone()).await {
            Ok(value) => Outcome::success(value),
            Err(err) => match activity.retry_policy.next_retry(attempt, &err) {
                Some(delay) => {
                    let at = self.clock.now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    warn!(error = %err, ?delay, "activity attempt failed, retrying");
                    self.scheduler
                        .schedule(
                            at,
                            ScheduledCall::RunActivity {
                                workflow_id,
                                generation,
                                step_number,
                                activity_type: activity_type.to_string(),
                                input,
                                attempt: attempt + 1,
                            },
                        )
                        .await?;
                    return Ok(());
                }
                None => {
                    warn!(error = %err, "activity failed");
                    Outcome::error(err.message)
                }
            },
        };

        self.complete_activity(workflow_id, generation, step_number, outcome)
            .await
    }

    /// Record the outcome of an activity step and schedule a resume
    #[instrument(skip(self, outcome), fields(%workflow_id, generation, step_number))]
    pub async fn complete_activity(
        &self,
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
        outcome: Outcome,
    ) -> Result<(), EngineError> {
        match self.store.blocked_by(workflow_id).await? {
            Some(entry) if entry.step_number == step_number && is_activity(&entry.step) => {}
            _ => {
                return Err(StoreError::EntryNotInProgress {
                    workflow_id,
                    step_number,
                }
                .into())
            }
        }

        let now = self.clock.now();
        let success = outcome.is_success();
        self.store
            .complete_journal_entry(
                workflow_id,
                generation,
                step_number,
                StepType::Function,
                outcome,
                now,
            )
            .await?;
        self.scheduler
            .schedule(
                now,
                ScheduledCall::Resume {
                    workflow_id,
                    generation,
                },
            )
            .await?;

        info!(success, "activity completed");
        Ok(())
    }

    /// Handle a `RunActivity` whose step is no longer pending
    ///
    /// If the workflow is parked right after that step, the resume scheduled
    /// on completion may have been lost, so schedule it again.
    async fn resume_after_activity(
        &self,
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
    ) -> Result<(), EngineError> {
        let record = self.store.get_workflow(workflow_id).await?;
        if record.generation != generation || record.is_completed() || record.executing {
            debug!("activity step no longer pending, skipping");
            return Ok(());
        }

        let journal = self.store.load_journal(workflow_id, generation).await?;
        let parked = matches!(
            journal.last(),
            Some(entry) if entry.step_number == step_number && !entry.is_in_progress()
        );
        if !parked {
            debug!("activity step no longer pending, skipping");
            return Ok(());
        }

        debug!("activity already completed, scheduling resume again");
        self.scheduler
            .schedule(
                self.clock.now(),
                ScheduledCall::Resume {
                    workflow_id,
                    generation,
                },
            )
            .await?;
        Ok(())
    }

    /// Refresh the liveness timestamp of an executing workflow
    pub async fn heartbeat(&self, workflow_id: Uuid, generation: u64) -> Result<(), EngineError> {
        self.store
            .heartbeat_workflow(workflow_id, generation, self.clock.now())
            .await?;
        debug!(%workflow_id, generation, "heartbeat");
        Ok(())
    }

    /// Suspend until `until` and schedule the wake-up
    pub async fn suspend_for_sleep(
        &self,
        workflow_id: Uuid,
        generation: u64,
        until: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.store
            .suspend_workflow(workflow_id, generation, Some(until))
            .await?;
        self.scheduler
            .schedule(
                until,
                ScheduledCall::Resume {
                    workflow_id,
                    generation,
                },
            )
            .await?;
        Ok(())
    }

    async fn suspend_for_activity(
        &self,
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
        activity_type: String,
        input: Value,
    ) -> Result<(), EngineError> {
        self.store
            .suspend_workflow(workflow_id, generation, None)
            .await?;
        self.scheduler
            .schedule(
                self.clock.now(),
                ScheduledCall::RunActivity {
                    workflow_id,
                    generation,
                    step_number,
                    activity_type,
                    input,
                    attempt: 1,
                },
            )
            .await?;
        Ok(())
    }

    /// Heartbeat until a refresh fails, then interrupt the executor
    async fn heartbeat_loop(
        &self,
        workflow_id: Uuid,
        generation: u64,
        channel: &Channel<StepRequest, EngineError>,
    ) -> EngineError {
        // config may bypass the builder's clamp
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(err) = self.heartbeat(workflow_id, generation).await {
                channel.interrupt(err.clone());
                return err;
            }
        }
    }
}

fn is_activity(step: &Step) -> bool {
    matches!(
        step,
        Step::Function {
            function_type: FunctionType::Activity,
            in_progress: true,
            ..
        }
    )
}
