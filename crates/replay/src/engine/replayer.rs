//! Step executor
//!
//! Consumes step requests from the handler one at a time. While journal
//! entries remain, each request is matched against the next entry and
//! answered from it; past the end of the journal, requests are recorded and
//! executed. The executor stops at the first step that needs the invocation
//! to suspend.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use super::EngineError;
use crate::channel::Channel;
use crate::clock::Clock;
use crate::persistence::{WorkflowRecord, WorkflowStore};
use crate::workflow::{
    FunctionType, InlineFn, JournalEntry, Outcome, RequestKind, Step, StepError, StepRequest,
    StepType,
};

/// The journal and the handler disagree, or the journal is malformed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    /// The handler issued a different step than the one recorded
    #[error("step {step_number} mismatch: journal recorded {recorded}, handler requested {requested}")]
    Mismatch {
        step_number: u32,
        recorded: String,
        requested: String,
    },

    /// An in-progress entry that replay cannot resolve
    #[error("step {step_number} is an in-progress {step_type} step")]
    UnexpectedInProgress { step_number: u32, step_type: StepType },

    /// A completed function entry without an outcome
    #[error("completed step {step_number} has no recorded outcome")]
    MissingOutcome { step_number: u32 },

    /// Loaded journal has a gap or duplicate
    #[error("journal is not contiguous: expected step {expected}, found {actual}")]
    NonContiguous { expected: u32, actual: u32 },

    /// Loaded journal has an in-progress entry before its end
    #[error("journal entry {step_number} is in progress but is not the last entry")]
    InProgressNotLast { step_number: u32 },

    /// Sleep durations must be at least one millisecond
    #[error("invalid sleep duration at step {step_number}")]
    InvalidSleep { step_number: u32 },

    /// The workflow issued more steps than allowed
    #[error("journal limit of {limit} entries reached")]
    JournalLimit { limit: usize },
}

/// Check a loaded journal before replaying it
///
/// Entries must be numbered 0, 1, 2... and only the last may be in progress.
pub(crate) fn validate_journal(journal: &[JournalEntry]) -> Result<(), ReplayError> {
    let last = journal.len().saturating_sub(1);
    for (index, entry) in journal.iter().enumerate() {
        let expected = index as u32;
        if entry.step_number != expected {
            return Err(ReplayError::NonContiguous {
                expected,
                actual: entry.step_number,
            });
        }
        if entry.is_in_progress() && index != last {
            return Err(ReplayError::InProgressNotLast {
                step_number: entry.step_number,
            });
        }
    }
    Ok(())
}

/// Why the executor stopped
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Suspension {
    /// A sleep has not elapsed yet
    Sleep {
        step_number: u32,
        deadline: DateTime<Utc>,
        remaining: Duration,
    },

    /// An activity was recorded and must be handed off
    Activity {
        step_number: u32,
        activity_type: String,
        input: Value,
    },
}

fn duration_millis(duration: &Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn matches(kind: &RequestKind, step: &Step) -> bool {
    match (kind, step) {
        (
            RequestKind::Inline { label, .. },
            Step::Function {
                function_type: FunctionType::Inline,
                handle,
                ..
            },
        ) => label == handle,
        (
            RequestKind::Activity {
                activity_type,
                input,
            },
            Step::Function {
                function_type: FunctionType::Activity,
                handle,
                args,
                ..
            },
        ) => activity_type == handle && input == args,
        (RequestKind::Sleep { duration }, Step::Sleep { duration_ms, .. }) => {
            duration_millis(duration) == *duration_ms
        }
        _ => false,
    }
}

pub(crate) struct StepExecutor<'a> {
    workflow_id: Uuid,
    generation: u64,
    /// Invocation timestamp; sleeps are judged against it
    now: DateTime<Utc>,
    store: &'a dyn WorkflowStore,
    clock: &'a dyn Clock,
    journal: VecDeque<JournalEntry>,
    next_step_number: u32,
    max_entries: usize,
    requests: Channel<StepRequest, EngineError>,
}

impl<'a> StepExecutor<'a> {
    pub(crate) fn new(
        workflow: &WorkflowRecord,
        now: DateTime<Utc>,
        store: &'a dyn WorkflowStore,
        clock: &'a dyn Clock,
        journal: Vec<JournalEntry>,
        max_entries: usize,
        requests: Channel<StepRequest, EngineError>,
    ) -> Self {
        Self {
            workflow_id: workflow.id,
            generation: workflow.generation,
            now,
            store,
            clock,
            next_step_number: journal.len() as u32,
            journal: journal.into(),
            max_entries,
            requests,
        }
    }

    /// Serve requests until one requires suspension
    ///
    /// The request being served is held until this returns, so the handler
    /// never observes a dropped reply before the invocation has decided.
    pub(crate) async fn run(&mut self) -> Result<Suspension, EngineError> {
        loop {
            let request = self.requests.receive().await?;
            let suspension = match self.journal.pop_front() {
                Some(entry) => self.replay(request, entry).await?,
                None => self.record(request).await?,
            };
            if let Some(suspension) = suspension {
                return Ok(suspension);
            }
        }
    }

    async fn replay(
        &mut self,
        request: StepRequest,
        entry: JournalEntry,
    ) -> Result<Option<Suspension>, EngineError> {
        let step_number = entry.step_number;
        if !matches(&request.kind, &entry.step) {
            let err = ReplayError::Mismatch {
                step_number,
                recorded: entry.step.describe(),
                requested: request.kind.describe(),
            };
            error!(workflow_id = %self.workflow_id, %err, "nondeterministic workflow");
            return Err(err.into());
        }

        match entry.step {
            Step::Function {
                in_progress: false,
                outcome,
                ..
            } => {
                let outcome = outcome.ok_or(ReplayError::MissingOutcome { step_number })?;
                debug!(workflow_id = %self.workflow_id, step_number, "replayed function step");
                StepRequest::resolve(request.reply, outcome);
                Ok(None)
            }
            Step::Function {
                function_type: FunctionType::Inline,
                in_progress: true,
                ..
            } => {
                // left behind by a dead invocation; its closure never finished
                let StepRequest { kind, reply } = request;
                let RequestKind::Inline { run, .. } = kind else {
                    return Err(ReplayError::UnexpectedInProgress {
                        step_number,
                        step_type: StepType::Function,
                    }
                    .into());
                };
                debug!(workflow_id = %self.workflow_id, step_number, "re-running unfinished inline step");
                self.run_inline(step_number, run, reply).await?;
                Ok(None)
            }
            Step::Function {
                in_progress: true, ..
            } => Err(ReplayError::UnexpectedInProgress {
                step_number,
                step_type: StepType::Function,
            }
            .into()),
            Step::Sleep {
                in_progress: false,
                ..
            } => {
                StepRequest::resolve(request.reply, Outcome::success(Value::Null));
                Ok(None)
            }
            Step::Sleep {
                in_progress: true,
                deadline,
                ..
            } => {
                if self.now < deadline {
                    let remaining = (deadline - self.now).to_std().unwrap_or_default();
                    debug!(workflow_id = %self.workflow_id, step_number, ?remaining, "sleep not elapsed");
                    return Ok(Some(Suspension::Sleep {
                        step_number,
                        deadline,
                        remaining,
                    }));
                }

                self.store
                    .complete_journal_entry(
                        self.workflow_id,
                        self.generation,
                        step_number,
                        StepType::Sleep,
                        Outcome::success(Value::Null),
                        self.clock.now(),
                    )
                    .await?;
                debug!(workflow_id = %self.workflow_id, step_number, "sleep elapsed");
                StepRequest::resolve(request.reply, Outcome::success(Value::Null));
                Ok(None)
            }
        }
    }

    async fn record(&mut self, request: StepRequest) -> Result<Option<Suspension>, EngineError> {
        let step_number = self.next_step_number;
        if step_number as usize >= self.max_entries {
            return Err(ReplayError::JournalLimit {
                limit: self.max_entries,
            }
            .into());
        }

        let StepRequest { kind, reply } = request;
        match kind {
            RequestKind::Sleep { duration } => {
                let duration_ms = duration_millis(&duration);
                let deadline = i64::try_from(duration_ms)
                    .ok()
                    .filter(|ms| *ms > 0)
                    .and_then(|ms| {
                        self.clock
                            .now()
                            .checked_add_signed(chrono::Duration::milliseconds(ms))
                    })
                    .ok_or(ReplayError::InvalidSleep { step_number })?;

                self.push(
                    step_number,
                    Step::Sleep {
                        duration_ms,
                        deadline,
                        in_progress: true,
                    },
                )
                .await?;

                Ok(Some(Suspension::Sleep {
                    step_number,
                    deadline,
                    remaining: duration,
                }))
            }
            RequestKind::Inline { label, run } => {
                self.push(
                    step_number,
                    Step::Function {
                        function_type: FunctionType::Inline,
                        handle: label,
                        args: Value::Null,
                        in_progress: true,
                        outcome: None,
                        started_at: self.clock.now(),
                        completed_at: None,
                    },
                )
                .await?;

                self.run_inline(step_number, run, reply).await?;
                Ok(None)
            }
            RequestKind::Activity {
                activity_type,
                input,
            } => {
                self.push(
                    step_number,
                    Step::Function {
                        function_type: FunctionType::Activity,
                        handle: activity_type.clone(),
                        args: input.clone(),
                        in_progress: true,
                        outcome: None,
                        started_at: self.clock.now(),
                        completed_at: None,
                    },
                )
                .await?;

                Ok(Some(Suspension::Activity {
                    step_number,
                    activity_type,
                    input,
                }))
            }
        }
    }

    /// Run an inline closure and complete its in-progress entry
    async fn run_inline(
        &mut self,
        step_number: u32,
        run: InlineFn,
        reply: oneshot::Sender<Result<Value, StepError>>,
    ) -> Result<(), EngineError> {
        let outcome = Outcome::from(run().await);
        self.store
            .complete_journal_entry(
                self.workflow_id,
                self.generation,
                step_number,
                StepType::Function,
                outcome.clone(),
                self.clock.now(),
            )
            .await?;

        debug!(
            workflow_id = %self.workflow_id,
            step_number,
            success = outcome.is_success(),
            "inline step recorded"
        );
        StepRequest::resolve(reply, outcome);
        Ok(())
    }

    async fn push(&mut self, step_number: u32, step: Step) -> Result<JournalEntry, EngineError> {
        let entry = self
            .store
            .push_journal_entry(self.workflow_id, self.generation, step_number, step)
            .await?;
        self.next_step_number += 1;
        Ok(entry)
    }
}
