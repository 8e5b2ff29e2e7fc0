//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{JournalEntry, Outcome, Step, StepType};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Journal entry not found
    #[error("journal entry {step_number} not found for workflow {workflow_id}")]
    JournalEntryNotFound { workflow_id: Uuid, step_number: u32 },

    /// Caller's generation no longer owns the workflow
    #[error("stale generation: caller holds {expected}, workflow is at {actual}")]
    StaleGeneration { expected: u64, actual: u64 },

    /// Another invocation of this generation is running
    #[error("workflow already executing: {0}")]
    AlreadyExecuting(Uuid),

    /// Workflow has completed
    #[error("workflow not running: {0}")]
    NotRunning(Uuid),

    /// Workflow is not executing, so it cannot be suspended or heartbeated
    #[error("workflow not executing: {0}")]
    NotExecuting(Uuid),

    /// A journal entry already exists at this position
    #[error("journal entry {step_number} already exists for workflow {workflow_id}")]
    DuplicateStep { workflow_id: Uuid, step_number: u32 },

    /// Journal entries must be contiguous
    #[error("journal gap: expected step {expected}, got {actual}")]
    StepGap { expected: u32, actual: u32 },

    /// Only one entry may be in progress at a time
    #[error("workflow {0} already has an in-progress journal entry")]
    MultipleInProgress(Uuid),

    /// Completion targets an entry that is already complete
    #[error("journal entry {step_number} of workflow {workflow_id} is not in progress")]
    EntryNotInProgress { workflow_id: Uuid, step_number: u32 },

    /// Completion targets an entry of another kind
    #[error("journal entry {step_number} is a {actual} step, expected {expected}")]
    WrongStepType {
        step_number: u32,
        expected: StepType,
        actual: StepType,
    },

    /// New entries must be inserted in progress
    #[error("invalid journal entry: {0}")]
    InvalidEntry(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// The caller lost ownership of the workflow and must stop
    pub fn is_fencing(&self) -> bool {
        matches!(
            self,
            Self::StaleGeneration { .. }
                | Self::AlreadyExecuting(_)
                | Self::NotRunning(_)
                | Self::NotExecuting(_)
        )
    }

    /// The journal would be corrupted by the operation
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::DuplicateStep { .. }
                | Self::StepGap { .. }
                | Self::MultipleInProgress(_)
                | Self::EntryNotInProgress { .. }
                | Self::WrongStepType { .. }
                | Self::InvalidEntry(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Lifecycle state of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowState {
    /// Not yet completed (possibly executing, sleeping or awaiting an activity)
    Running,

    /// Terminal; the outcome never changes
    Completed {
        outcome: Outcome,
        completed_at: DateTime<Utc>,
    },
}

impl WorkflowState {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Get the outcome of a completed workflow
    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            Self::Running => None,
            Self::Completed { outcome, .. } => Some(outcome),
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed { outcome, .. } if outcome.is_success() => write!(f, "completed"),
            Self::Completed { .. } => write!(f, "failed"),
        }
    }
}

/// Persistent workflow row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: Uuid,

    /// Handler name used to find the workflow on resume
    pub workflow_type: String,

    /// Serialized input passed to the handler on every invocation
    pub args: serde_json::Value,

    pub state: WorkflowState,

    /// Ownership epoch; incremented on each recovery
    pub generation: u64,

    /// Whether an invocation currently owns the workflow
    pub executing: bool,

    pub last_heartbeat: DateTime<Utc>,

    /// Set while the workflow is suspended on a sleep
    pub sleeping_until: Option<DateTime<Utc>>,

    pub started_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Create a fresh record at generation 0, not executing
    pub fn new(
        id: Uuid,
        workflow_type: impl Into<String>,
        args: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            workflow_type: workflow_type.into(),
            args,
            state: WorkflowState::Running,
            generation: 0,
            executing: false,
            last_heartbeat: now,
            sleeping_until: None,
            started_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    /// Check the caller's generation against this record
    pub fn check_generation(&self, generation: u64) -> Result<(), StoreError> {
        if self.generation != generation {
            return Err(StoreError::StaleGeneration {
                expected: generation,
                actual: self.generation,
            });
        }
        Ok(())
    }

    /// Check the workflow can still be mutated by `generation`
    pub fn check_running(&self, generation: u64) -> Result<(), StoreError> {
        self.check_generation(generation)?;
        if self.is_completed() {
            return Err(StoreError::NotRunning(self.id));
        }
        Ok(())
    }

    /// Check `generation` currently owns an executing invocation
    pub fn check_executing(&self, generation: u64) -> Result<(), StoreError> {
        self.check_running(generation)?;
        if !self.executing {
            return Err(StoreError::NotExecuting(self.id));
        }
        Ok(())
    }
}

/// Validate that `step` may be appended at `step_number` to `journal`
///
/// Shared by every backend so the integrity rules stay identical.
pub fn check_append(
    workflow_id: Uuid,
    journal: &[JournalEntry],
    step_number: u32,
    step: &Step,
) -> Result<(), StoreError> {
    if !step.is_in_progress() {
        return Err(StoreError::InvalidEntry(format!(
            "step {step_number} must be recorded in progress"
        )));
    }
    if journal.iter().any(|e| e.step_number == step_number) {
        return Err(StoreError::DuplicateStep {
            workflow_id,
            step_number,
        });
    }
    let expected = journal
        .iter()
        .map(|e| e.step_number + 1)
        .max()
        .unwrap_or(0);
    if step_number != expected {
        return Err(StoreError::StepGap {
            expected,
            actual: step_number,
        });
    }
    if journal.iter().any(JournalEntry::is_in_progress) {
        return Err(StoreError::MultipleInProgress(workflow_id));
    }
    Ok(())
}

/// Validate that `entry` may be completed as a step of type `expected`
pub fn check_completion(entry: &JournalEntry, expected: StepType) -> Result<(), StoreError> {
    let actual = entry.step.step_type();
    if actual != expected {
        return Err(StoreError::WrongStepType {
            step_number: entry.step_number,
            expected,
            actual,
        });
    }
    if !entry.is_in_progress() {
        return Err(StoreError::EntryNotInProgress {
            workflow_id: entry.workflow_id,
            step_number: entry.step_number,
        });
    }
    Ok(())
}

/// Durable storage for workflow records and their journals
///
/// Every mutating operation is atomic and checks the caller's generation
/// before writing, so a superseded invocation can never change anything.
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Create a new workflow record at generation 0
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        args: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRecord, StoreError>;

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError>;

    /// Claim the workflow for an invocation
    ///
    /// Requires matching generation and not executing. Completed workflows are
    /// returned untouched. Sets `executing` and refreshes the heartbeat.
    async fn start_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRecord, StoreError>;

    /// Release the workflow, optionally recording a sleep deadline
    ///
    /// Requires running, executing and matching generation.
    async fn suspend_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        sleeping_until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Refresh the heartbeat
    ///
    /// Requires running and matching generation.
    async fn heartbeat_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record the terminal outcome
    ///
    /// Requires running and matching generation. Clears `executing`.
    async fn complete_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Journal Operations
    // =========================================================================

    /// Load the journal ordered by step number
    async fn load_journal(
        &self,
        workflow_id: Uuid,
        generation: u64,
    ) -> Result<Vec<JournalEntry>, StoreError>;

    /// Append an in-progress entry
    ///
    /// Rejects duplicates, gaps and a second in-progress entry.
    async fn push_journal_entry(
        &self,
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
        step: Step,
    ) -> Result<JournalEntry, StoreError>;

    /// Complete an in-progress entry of the expected type
    async fn complete_journal_entry(
        &self,
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
        expected: StepType,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<JournalEntry, StoreError>;

    /// The in-progress entry the workflow is waiting on, if any
    async fn blocked_by(&self, workflow_id: Uuid) -> Result<Option<JournalEntry>, StoreError>;

    // =========================================================================
    // Recovery Operations
    // =========================================================================

    /// Executing workflows whose heartbeat is older than `cutoff`, oldest first
    async fn find_stale_workflows(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// Take over a stale workflow
    ///
    /// Requires running and `generation` to still be current. Increments the
    /// generation, clears `executing` and `sleeping_until`, and refreshes the
    /// heartbeat. Returns the new record.
    async fn reclaim_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRecord, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FunctionType;
    use serde_json::json;

    fn inline(in_progress: bool) -> Step {
        Step::Function {
            function_type: FunctionType::Inline,
            handle: "a".into(),
            args: json!(null),
            in_progress,
            outcome: (!in_progress).then(|| Outcome::success(json!(1))),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn entry(step_number: u32, in_progress: bool) -> JournalEntry {
        JournalEntry {
            workflow_id: Uuid::nil(),
            step_number,
            step: inline(in_progress),
        }
    }

    #[test]
    fn test_check_append() {
        let id = Uuid::nil();
        let journal = vec![entry(0, false), entry(1, false)];

        assert!(check_append(id, &journal, 2, &inline(true)).is_ok());
        assert_eq!(
            check_append(id, &journal, 1, &inline(true)),
            Err(StoreError::DuplicateStep {
                workflow_id: id,
                step_number: 1
            })
        );
        assert_eq!(
            check_append(id, &journal, 3, &inline(true)),
            Err(StoreError::StepGap {
                expected: 2,
                actual: 3
            })
        );
        assert!(matches!(
            check_append(id, &journal, 2, &inline(false)),
            Err(StoreError::InvalidEntry(_))
        ));
        assert!(check_append(id, &[], 0, &inline(true)).is_ok());
    }

    #[test]
    fn test_check_append_single_in_progress() {
        let journal = vec![entry(0, true)];
        assert_eq!(
            check_append(Uuid::nil(), &journal, 1, &inline(true)),
            Err(StoreError::MultipleInProgress(Uuid::nil()))
        );
    }

    #[test]
    fn test_check_completion() {
        assert!(check_completion(&entry(0, true), StepType::Function).is_ok());
        assert!(matches!(
            check_completion(&entry(0, true), StepType::Sleep),
            Err(StoreError::WrongStepType { .. })
        ));
        assert!(matches!(
            check_completion(&entry(0, false), StepType::Function),
            Err(StoreError::EntryNotInProgress { .. })
        ));
    }

    #[test]
    fn test_record_checks() {
        let mut record = WorkflowRecord::new(Uuid::now_v7(), "wf", json!({}), Utc::now());

        assert!(record.check_running(0).is_ok());
        assert_eq!(
            record.check_generation(1),
            Err(StoreError::StaleGeneration {
                expected: 1,
                actual: 0
            })
        );
        assert_eq!(
            record.check_executing(0),
            Err(StoreError::NotExecuting(record.id))
        );

        record.state = WorkflowState::Completed {
            outcome: Outcome::success(json!(null)),
            completed_at: Utc::now(),
        };
        assert_eq!(record.check_running(0), Err(StoreError::NotRunning(record.id)));
        assert!(StoreError::NotRunning(record.id).is_fencing());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WorkflowState::Running.to_string(), "running");
        let failed = WorkflowState::Completed {
            outcome: Outcome::error("x"),
            completed_at: Utc::now(),
        };
        assert_eq!(failed.to_string(), "failed");
    }
}
