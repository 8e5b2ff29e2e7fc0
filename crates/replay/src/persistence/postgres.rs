//! PostgreSQL implementation of WorkflowStore
//!
//! Every mutation runs in a transaction that locks the workflow row with
//! `SELECT ... FOR UPDATE`, applies the same generation and integrity checks
//! as the in-memory store, and writes the row back. A partial unique index
//! enforces the single in-progress journal entry at the database level too.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{JournalEntry, Outcome, Step, StepType};

/// PostgreSQL implementation of WorkflowStore
///
/// # Example
///
/// ```ignore
/// use everruns_replay::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(db_error)
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn row_to_record(row: &PgRow) -> Result<WorkflowRecord, StoreError> {
    let state: serde_json::Value = row.try_get("state").map_err(db_error)?;
    let generation: i64 = row.try_get("generation").map_err(db_error)?;

    Ok(WorkflowRecord {
        id: row.try_get("id").map_err(db_error)?,
        workflow_type: row.try_get("workflow_type").map_err(db_error)?,
        args: row.try_get("args").map_err(db_error)?,
        state: serde_json::from_value(state)?,
        generation: generation as u64,
        executing: row.try_get("executing").map_err(db_error)?,
        last_heartbeat: row.try_get("last_heartbeat").map_err(db_error)?,
        sleeping_until: row.try_get("sleeping_until").map_err(db_error)?,
        started_at: row.try_get("started_at").map_err(db_error)?,
    })
}

fn row_to_entry(row: &PgRow) -> Result<JournalEntry, StoreError> {
    let step_number: i32 = row.try_get("step_number").map_err(db_error)?;
    let step: serde_json::Value = row.try_get("step").map_err(db_error)?;

    Ok(JournalEntry {
        workflow_id: row.try_get("workflow_id").map_err(db_error)?,
        step_number: step_number as u32,
        step: serde_json::from_value(step)?,
    })
}

const SELECT_WORKFLOW: &str = r#"
    SELECT id, workflow_type, args, state, generation, executing,
           last_heartbeat, sleeping_until, started_at
    FROM replay_workflows
"#;

/// Load and lock a workflow row for the rest of the transaction
async fn lock_workflow(
    tx: &mut Transaction<'static, Postgres>,
    workflow_id: Uuid,
) -> Result<WorkflowRecord, StoreError> {
    let row = sqlx::query(&format!("{SELECT_WORKFLOW} WHERE id = $1 FOR UPDATE"))
        .bind(workflow_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
    row_to_record(&row)
}

/// Write back the mutable columns of a locked workflow row
async fn save_workflow(
    tx: &mut Transaction<'static, Postgres>,
    record: &WorkflowRecord,
) -> Result<(), StoreError> {
    let state = serde_json::to_value(&record.state)?;
    sqlx::query(
        r#"
        UPDATE replay_workflows
        SET state = $2, generation = $3, executing = $4,
            last_heartbeat = $5, sleeping_until = $6
        WHERE id = $1
        "#,
    )
    .bind(record.id)
    .bind(&state)
    .bind(record.generation as i64)
    .bind(record.executing)
    .bind(record.last_heartbeat)
    .bind(record.sleeping_until)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn load_entries(
    tx: &mut Transaction<'static, Postgres>,
    workflow_id: Uuid,
) -> Result<Vec<JournalEntry>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT workflow_id, step_number, step
        FROM replay_journal
        WHERE workflow_id = $1
        ORDER BY step_number
        "#,
    )
    .bind(workflow_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_error)?;

    rows.iter().map(row_to_entry).collect()
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, args))]
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        args: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRecord, StoreError> {
        let record = WorkflowRecord::new(workflow_id, workflow_type, args, now);
        let state = serde_json::to_value(&record.state)?;

        sqlx::query(
            r#"
            INSERT INTO replay_workflows
                (id, workflow_type, args, state, generation, executing, last_heartbeat, started_at)
            VALUES ($1, $2, $3, $4, 0, FALSE, $5, $5)
            "#,
        )
        .bind(workflow_id)
        .bind(workflow_type)
        .bind(&record.args)
        .bind(&state)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create workflow: {}", e);
            db_error(e)
        })?;

        debug!(%workflow_id, %workflow_type, "created workflow");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query(&format!("{SELECT_WORKFLOW} WHERE id = $1"))
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        row_to_record(&row)
    }

    #[instrument(skip(self))]
    async fn start_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRecord, StoreError> {
        let mut tx = self.begin().await?;
        let mut record = lock_workflow(&mut tx, workflow_id).await?;
        record.check_generation(generation)?;
        if record.is_completed() {
            return Ok(record);
        }
        if record.executing {
            return Err(StoreError::AlreadyExecuting(workflow_id));
        }

        if record.sleeping_until.is_some_and(|until| until <= now) {
            record.sleeping_until = None;
        }
        record.executing = true;
        record.last_heartbeat = now;
        save_workflow(&mut tx, &record).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn suspend_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        sleeping_until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let mut record = lock_workflow(&mut tx, workflow_id).await?;
        record.check_executing(generation)?;

        record.executing = false;
        record.sleeping_until = sleeping_until;
        save_workflow(&mut tx, &record).await?;
        tx.commit().await.map_err(db_error)
    }

    #[instrument(skip(self))]
    async fn heartbeat_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let mut record = lock_workflow(&mut tx, workflow_id).await?;
        record.check_running(generation)?;

        record.last_heartbeat = now;
        save_workflow(&mut tx, &record).await?;
        tx.commit().await.map_err(db_error)
    }

    #[instrument(skip(self, outcome))]
    async fn complete_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let mut record = lock_workflow(&mut tx, workflow_id).await?;
        record.check_running(generation)?;

        record.executing = false;
        record.sleeping_until = None;
        record.state = WorkflowState::Completed {
            outcome,
            completed_at: now,
        };
        save_workflow(&mut tx, &record).await?;
        tx.commit().await.map_err(db_error)
    }

    #[instrument(skip(self))]
    async fn load_journal(
        &self,
        workflow_id: Uuid,
        generation: u64,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        let mut tx = self.begin().await?;
        let record = lock_workflow(&mut tx, workflow_id).await?;
        record.check_generation(generation)?;
        let entries = load_entries(&mut tx, workflow_id).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(entries)
    }

    #[instrument(skip(self, step))]
    async fn push_journal_entry(
        &self,
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
        step: Step,
    ) -> Result<JournalEntry, StoreError> {
        let mut tx = self.begin().await?;
        let record = lock_workflow(&mut tx, workflow_id).await?;
        record.check_running(generation)?;

        let journal = load_entries(&mut tx, workflow_id).await?;
        check_append(workflow_id, &journal, step_number, &step)?;

        let data = serde_json::to_value(&step)?;
        sqlx::query(
            r#"
            INSERT INTO replay_journal (workflow_id, step_number, step, in_progress)
            VALUES ($1, $2, $3, TRUE)
            "#,
        )
        .bind(workflow_id)
        .bind(step_number as i32)
        .bind(&data)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to push journal entry: {}", e);
            db_error(e)
        })?;

        tx.commit().await.map_err(db_error)?;
        debug!(%workflow_id, step_number, "journal entry appended");
        Ok(JournalEntry {
            workflow_id,
            step_number,
            step,
        })
    }

    #[instrument(skip(self, outcome))]
    async fn complete_journal_entry(
        &self,
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
        expected: StepType,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<JournalEntry, StoreError> {
        let mut tx = self.begin().await?;
        let record = lock_workflow(&mut tx, workflow_id).await?;
        record.check_running(generation)?;

        let row = sqlx::query(
            r#"
            SELECT workflow_id, step_number, step
            FROM replay_journal
            WHERE workflow_id = $1 AND step_number = $2
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .bind(step_number as i32)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::JournalEntryNotFound {
            workflow_id,
            step_number,
        })?;

        let mut entry = row_to_entry(&row)?;
        check_completion(&entry, expected)?;
        entry.step.complete(outcome, now);

        let data = serde_json::to_value(&entry.step)?;
        sqlx::query(
            r#"
            UPDATE replay_journal
            SET step = $3, in_progress = FALSE
            WHERE workflow_id = $1 AND step_number = $2
            "#,
        )
        .bind(workflow_id)
        .bind(step_number as i32)
        .bind(&data)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(entry)
    }

    #[instrument(skip(self))]
    async fn blocked_by(&self, workflow_id: Uuid) -> Result<Option<JournalEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, step_number, step
            FROM replay_journal
            WHERE workflow_id = $1 AND in_progress
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(row_to_entry).transpose()
    }

    #[instrument(skip(self))]
    async fn find_stale_workflows(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_WORKFLOW} WHERE executing AND last_heartbeat < $1 ORDER BY last_heartbeat"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_record).collect()
    }

    #[instrument(skip(self))]
    async fn reclaim_workflow(
        &self,
        workflow_id: Uuid,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRecord, StoreError> {
        let mut tx = self.begin().await?;
        let mut record = lock_workflow(&mut tx, workflow_id).await?;
        record.check_running(generation)?;

        record.executing = false;
        record.generation += 1;
        record.last_heartbeat = now;
        record.sleeping_until = None;
        save_workflow(&mut tx, &record).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(record)
    }
}
