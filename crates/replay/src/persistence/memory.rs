//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::store::*;
use crate::workflow::{JournalEntry, Outcome, Step, StepType};

#[derive(Default)]
struct Tables {
    workflows: HashMap<Uuid, WorkflowRecord>,
    journals: HashMap<Uuid, Vec<JournalEntry>>,
}

impl Tables {
    fn workflow(&self, workflow_id: Uuid) -> Result<&WorkflowRecord, StoreError> {
        self.workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    fn workflow_mut(&mut self, workflow_id: Uuid) -> Result<&mut WorkflowRecord, StoreError> {
        self.workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }
}

/// In-memory implementation of WorkflowStore
///
/// Workflows and journals share one lock, so every operation is atomic across
/// both tables. Same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use everruns_replay::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    tables: RwLock<Tables>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.tables.read().workflows.len()
    }

    /// Get the number of journal entries of a workflow
    pub fn journal_len(&self, workflow_id: Uuid) -> usize {
        self.tables
            .read()
            .journals
            .get(&workflow_id)
            .map_or(0, Vec::len)
    }

    /// Clear all data
    pub fn clear(&self) {
        let mut tables = self.tables.write();
        tables.workflows.clear();
        tables.journals.clear();
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        args: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRecord, StoreError> {
        let mut tables = self.tables.write();
        if tables.workflows.contains_key(&workflow_id) {
            return Err(StoreError::Database(format!(
                "workflow already exists: {workflow_id}"
            )));
        }

        let record = WorkflowRecord::new(workflow_id, workflow_type, args, now);
        tables.workflows.insert(workflow_id, record.clone());
        tables.journals.insert(workflow_id, Vec::new());
        Ok(record)
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError> {
        self.tables.read().workflow(workflow_id).cloned()
    }

    async fn start_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRecord, StoreError> {
        let mut tables = self.tables.write();
        let record = tables.workflow_mut(workflow_id)?;
        record.check_generation(generation)?;
        if record.is_completed() {
            return Ok(record.clone());
        }
        if record.executing {
            return Err(StoreError::AlreadyExecuting(workflow_id));
        }

        if record.sleeping_until.is_some_and(|until| until <= now) {
            record.sleeping_until = None;
        }
        record.executing = true;
        record.last_heartbeat = now;
        Ok(record.clone())
    }

    async fn suspend_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        sleeping_until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let record = tables.workflow_mut(workflow_id)?;
        record.check_executing(generation)?;
        record.executing = false;
        record.sleeping_until = sleeping_until;
        Ok(())
    }

    async fn heartbeat_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let record = tables.workflow_mut(workflow_id)?;
        record.check_running(generation)?;
        record.last_heartbeat = now;
        Ok(())
    }

    async fn complete_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let record = tables.workflow_mut(workflow_id)?;
        record.check_running(generation)?;
        record.executing = false;
        record.sleeping_until = None;
        record.state = WorkflowState::Completed {
            outcome,
            completed_at: now,
        };
        Ok(())
    }

    async fn load_journal(
        &self,
        workflow_id: Uuid,
        generation: u64,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        let tables = self.tables.read();
        tables.workflow(workflow_id)?.check_generation(generation)?;

        let mut entries = tables
            .journals
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default();
        entries.sort_by_key(|e| e.step_number);
        Ok(entries)
    }

    async fn push_journal_entry(
        &self,
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
        step: Step,
    ) -> Result<JournalEntry, StoreError> {
        let mut tables = self.tables.write();
        tables.workflow(workflow_id)?.check_running(generation)?;

        let journal = tables.journals.entry(workflow_id).or_default();
        check_append(workflow_id, journal, step_number, &step)?;

        let entry = JournalEntry {
            workflow_id,
            step_number,
            step,
        };
        journal.push(entry.clone());
        debug!(%workflow_id, step_number, "journal entry appended");
        Ok(entry)
    }

    async fn complete_journal_entry(
        &self,
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
        expected: StepType,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<JournalEntry, StoreError> {
        let mut tables = self.tables.write();
        tables.workflow(workflow_id)?.check_running(generation)?;

        let entry = tables
            .journals
            .get_mut(&workflow_id)
            .and_then(|journal| journal.iter_mut().find(|e| e.step_number == step_number))
            .ok_or(StoreError::JournalEntryNotFound {
                workflow_id,
                step_number,
            })?;
        check_completion(entry, expected)?;

        entry.step.complete(outcome, now);
        Ok(entry.clone())
    }

    async fn blocked_by(&self, workflow_id: Uuid) -> Result<Option<JournalEntry>, StoreError> {
        let tables = self.tables.read();
        tables.workflow(workflow_id)?;
        Ok(tables
            .journals
            .get(&workflow_id)
            .and_then(|journal| journal.iter().find(|e| e.is_in_progress()))
            .cloned())
    }

    async fn find_stale_workflows(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let tables = self.tables.read();
        let mut stale: Vec<WorkflowRecord> = tables
            .workflows
            .values()
            .filter(|w| w.executing && w.last_heartbeat < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|w| w.last_heartbeat);
        Ok(stale)
    }

    async fn reclaim_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRecord, StoreError> {
        let mut tables = self.tables.write();
        let record = tables.workflow_mut(workflow_id)?;
        record.check_running(generation)?;

        record.executing = false;
        record.generation += 1;
        record.last_heartbeat = now;
        record.sleeping_until = None;
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FunctionType;
    use chrono::Duration;
    use serde_json::json;

    fn sleep_step(now: DateTime<Utc>) -> Step {
        Step::Sleep {
            duration_ms: 1000,
            deadline: now + Duration::seconds(1),
            in_progress: true,
        }
    }

    fn activity_step(now: DateTime<Utc>) -> Step {
        Step::Function {
            function_type: FunctionType::Activity,
            handle: "fetch".into(),
            args: json!({"url": "x"}),
            in_progress: true,
            outcome: None,
            started_at: now,
            completed_at: None,
        }
    }

    async fn started(store: &InMemoryWorkflowStore) -> Uuid {
        let id = Uuid::now_v7();
        let now = Utc::now();
        store
            .create_workflow(id, "wf", json!({"n": 1}), now)
            .await
            .expect("should create");
        store
            .start_workflow(id, 0, now)
            .await
            .expect("should start");
        id
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryWorkflowStore::new();
        let id = Uuid::now_v7();
        let created = store
            .create_workflow(id, "wf", json!({"n": 1}), Utc::now())
            .await
            .unwrap();

        let loaded = store.get_workflow(id).await.unwrap();
        assert_eq!(created, loaded);
        assert_eq!(loaded.generation, 0);
        assert!(!loaded.executing);
        assert_eq!(store.workflow_count(), 1);

        let missing = store.get_workflow(Uuid::now_v7()).await;
        assert!(matches!(missing, Err(StoreError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_concurrent_invocation() {
        let store = InMemoryWorkflowStore::new();
        let id = started(&store).await;

        let err = store.start_workflow(id, 0, Utc::now()).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExecuting(id));
        assert!(err.is_fencing());
    }

    #[tokio::test]
    async fn test_start_clears_elapsed_sleep_only() {
        let store = InMemoryWorkflowStore::new();
        let id = started(&store).await;
        let now = Utc::now();

        let future = now + Duration::seconds(60);
        store.suspend_workflow(id, 0, Some(future)).await.unwrap();
        let record = store.start_workflow(id, 0, now).await.unwrap();
        assert_eq!(record.sleeping_until, Some(future));

        store.suspend_workflow(id, 0, Some(now)).await.unwrap();
        let record = store.start_workflow(id, 0, now).await.unwrap();
        assert_eq!(record.sleeping_until, None);
        assert!(record.executing);
    }

    #[tokio::test]
    async fn test_suspend_requires_executing() {
        let store = InMemoryWorkflowStore::new();
        let id = started(&store).await;
        store.suspend_workflow(id, 0, None).await.unwrap();

        let err = store.suspend_workflow(id, 0, None).await.unwrap_err();
        assert_eq!(err, StoreError::NotExecuting(id));
    }

    #[tokio::test]
    async fn test_complete_is_terminal() {
        let store = InMemoryWorkflowStore::new();
        let id = started(&store).await;

        store
            .complete_workflow(id, 0, Outcome::success(json!(5)), Utc::now())
            .await
            .unwrap();

        let record = store.get_workflow(id).await.unwrap();
        assert!(record.is_completed());
        assert!(!record.executing);
        assert_eq!(record.state.outcome(), Some(&Outcome::success(json!(5))));

        let err = store
            .complete_workflow(id, 0, Outcome::error("late"), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotRunning(id));

        // start on a completed workflow is a no-op
        let record = store.start_workflow(id, 0, Utc::now()).await.unwrap();
        assert!(record.is_completed());
        assert!(!record.executing);
    }

    #[tokio::test]
    async fn test_push_and_complete_entries() {
        let store = InMemoryWorkflowStore::new();
        let id = started(&store).await;
        let now = Utc::now();

        store
            .push_journal_entry(id, 0, 0, activity_step(now))
            .await
            .unwrap();

        let err = store
            .push_journal_entry(id, 0, 1, sleep_step(now))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::MultipleInProgress(id));

        let blocked = store.blocked_by(id).await.unwrap().expect("should be blocked");
        assert_eq!(blocked.step_number, 0);

        let err = store
            .complete_journal_entry(id, 0, 0, StepType::Sleep, Outcome::success(json!(1)), now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongStepType { .. }));

        let entry = store
            .complete_journal_entry(
                id,
                0,
                0,
                StepType::Function,
                Outcome::success(json!(1)),
                now,
            )
            .await
            .unwrap();
        assert!(!entry.is_in_progress());
        assert!(store.blocked_by(id).await.unwrap().is_none());

        let err = store
            .complete_journal_entry(id, 0, 0, StepType::Function, Outcome::error("x"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EntryNotInProgress { .. }));

        let err = store
            .complete_journal_entry(id, 0, 7, StepType::Function, Outcome::error("x"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::JournalEntryNotFound { .. }));

        let err = store
            .push_journal_entry(id, 0, 0, sleep_step(now))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateStep { .. }));

        let err = store
            .push_journal_entry(id, 0, 2, sleep_step(now))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::StepGap {
                expected: 1,
                actual: 2
            }
        );

        assert_eq!(store.journal_len(id), 1);
    }

    #[tokio::test]
    async fn test_generation_fencing() {
        let store = InMemoryWorkflowStore::new();
        let id = started(&store).await;
        let now = Utc::now();

        let reclaimed = store.reclaim_workflow(id, 0, now).await.unwrap();
        assert_eq!(reclaimed.generation, 1);
        assert!(!reclaimed.executing);

        let stale = StoreError::StaleGeneration {
            expected: 0,
            actual: 1,
        };
        assert_eq!(store.heartbeat_workflow(id, 0, now).await, Err(stale.clone()));
        assert_eq!(
            store.push_journal_entry(id, 0, 0, sleep_step(now)).await,
            Err(stale.clone())
        );
        assert_eq!(store.load_journal(id, 0).await, Err(stale.clone()));
        assert_eq!(store.reclaim_workflow(id, 0, now).await, Err(stale));

        assert!(store.heartbeat_workflow(id, 1, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_find_stale_workflows() {
        let store = InMemoryWorkflowStore::new();
        let now = Utc::now();
        let old = now - Duration::minutes(30);

        let stale = Uuid::now_v7();
        store.create_workflow(stale, "wf", json!(null), old).await.unwrap();
        store.start_workflow(stale, 0, old).await.unwrap();

        let fresh = Uuid::now_v7();
        store.create_workflow(fresh, "wf", json!(null), now).await.unwrap();
        store.start_workflow(fresh, 0, now).await.unwrap();

        // Old heartbeat but not executing
        let idle = Uuid::now_v7();
        store.create_workflow(idle, "wf", json!(null), old).await.unwrap();

        let found = store
            .find_stale_workflows(now - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale);
    }
}
