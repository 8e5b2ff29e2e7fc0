//! PostgreSQL scheduler
//!
//! Due calls are leased with `FOR UPDATE SKIP LOCKED` so any number of
//! runtimes can poll the same table. A leased call that is never acknowledged
//! becomes visible again once its lease expires.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::{DueCall, ScheduledCall, Scheduler, SchedulerError};

/// PostgreSQL implementation of Scheduler
///
/// Uses the `replay_scheduled_calls` table created by the store migration.
#[derive(Clone)]
pub struct PostgresScheduler {
    pool: PgPool,
    lease: Duration,
}

impl PostgresScheduler {
    /// Create a scheduler with a 5 minute lease
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease: Duration::from_secs(300),
        }
    }

    /// How long a taken call stays hidden before being redelivered
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

fn db_error(e: sqlx::Error) -> SchedulerError {
    SchedulerError::Database(e.to_string())
}

#[async_trait]
impl Scheduler for PostgresScheduler {
    #[instrument(skip(self, call), fields(kind = call.kind()))]
    async fn schedule(
        &self,
        at: DateTime<Utc>,
        call: ScheduledCall,
    ) -> Result<Uuid, SchedulerError> {
        let id = Uuid::now_v7();
        let data = serde_json::to_value(&call)?;

        sqlx::query(
            r#"
            INSERT INTO replay_scheduled_calls (id, run_at, call)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to schedule call: {}", e);
            db_error(e)
        })?;

        debug!(%id, %at, "scheduled call");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn take_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueCall>, SchedulerError> {
        let lease = chrono::Duration::from_std(self.lease)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id
                FROM replay_scheduled_calls
                WHERE run_at <= $1
                  AND (leased_until IS NULL OR leased_until < $1)
                ORDER BY run_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE replay_scheduled_calls s
            SET leased_until = $3
            FROM due d
            WHERE s.id = d.id
            RETURNING s.id, s.run_at, s.call
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(now + lease)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut due = rows
            .iter()
            .map(|row| {
                let call: serde_json::Value = row.try_get("call").map_err(db_error)?;
                Ok(DueCall {
                    id: row.try_get("id").map_err(db_error)?,
                    run_at: row.try_get("run_at").map_err(db_error)?,
                    call: serde_json::from_value(call)?,
                })
            })
            .collect::<Result<Vec<_>, SchedulerError>>()?;

        // RETURNING does not preserve the CTE's order
        due.sort_by_key(|d| (d.run_at, d.id));
        Ok(due)
    }

    #[instrument(skip(self))]
    async fn acknowledge(&self, id: Uuid) -> Result<(), SchedulerError> {
        sqlx::query("DELETE FROM replay_scheduled_calls WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}
