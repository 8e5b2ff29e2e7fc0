//! Deferred callbacks
//!
//! The engine never waits in-process for a sleep or an activity. It records a
//! [`ScheduledCall`] with a run time and exits; the runtime later takes due
//! calls and dispatches them back into the engine.
//!
//! Delivery is at-least-once: a call is removed only when acknowledged, and a
//! duplicate is harmless because every resume is generation-checked.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::InMemoryScheduler;
pub use postgres::PostgresScheduler;

/// Error type for scheduler operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A callback into the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduledCall {
    /// Run (or re-run) the workflow's entry point
    Resume { workflow_id: Uuid, generation: u64 },

    /// Execute an activity recorded in the journal
    RunActivity {
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
        activity_type: String,
        input: serde_json::Value,
        /// 1-based attempt number
        #[serde(default = "first_attempt")]
        attempt: u32,
    },
}

fn first_attempt() -> u32 {
    1
}

impl ScheduledCall {
    /// Workflow the call targets
    pub fn workflow_id(&self) -> Uuid {
        match self {
            Self::Resume { workflow_id, .. } | Self::RunActivity { workflow_id, .. } => {
                *workflow_id
            }
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resume { .. } => "resume",
            Self::RunActivity { .. } => "run_activity",
        }
    }
}

/// A call whose run time has passed, handed to exactly one dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct DueCall {
    /// Identifier used to acknowledge the call
    pub id: Uuid,

    pub run_at: DateTime<Utc>,

    pub call: ScheduledCall,
}

/// Durable timer queue
#[async_trait]
pub trait Scheduler: Send + Sync + 'static {
    /// Schedule `call` to run at `at`
    async fn schedule(&self, at: DateTime<Utc>, call: ScheduledCall)
        -> Result<Uuid, SchedulerError>;

    /// Take up to `limit` calls due at `now`, oldest first
    ///
    /// Taken calls are hidden from other takers until acknowledged or, for
    /// backends with leases, until the lease expires.
    async fn take_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueCall>, SchedulerError>;

    /// Mark a taken call as done
    async fn acknowledge(&self, id: Uuid) -> Result<(), SchedulerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scheduled_call_serialization() {
        let id = Uuid::now_v7();
        let call = ScheduledCall::Resume {
            workflow_id: id,
            generation: 3,
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["type"], "resume");
        assert_eq!(value["generation"], 3);

        let parsed: ScheduledCall = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, call);
        assert_eq!(parsed.workflow_id(), id);
    }

    #[test]
    fn test_run_activity_defaults_to_first_attempt() {
        let id = Uuid::now_v7();
        let value = json!({
            "type": "run_activity",
            "workflow_id": id,
            "generation": 0,
            "step_number": 2,
            "activity_type": "fetch",
            "input": {"url": "https://example.com"}
        });

        let call: ScheduledCall = serde_json::from_value(value).unwrap();
        assert_eq!(call.kind(), "run_activity");
        assert!(matches!(call, ScheduledCall::RunActivity { attempt: 1, .. }));
    }
}
