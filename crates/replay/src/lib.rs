//! # Replay
//!
//! A durable workflow engine built on journaled replay.
//!
//! A workflow is an ordinary async function that performs its side effects
//! through a [`StepContext`]. Every step is recorded in a per-workflow
//! journal. When the workflow is resumed (after a sleep, an activity, or a
//! crash), the function runs again from the top and each step it issues is
//! answered from the journal instead of being re-executed, until the
//! journal runs out and new steps are recorded.
//!
//! ## Features
//!
//! - **Inline steps**: closures whose result is recorded once and replayed
//! - **Durable sleeps**: the invocation exits and a resume is scheduled
//! - **Activities**: handed off to the scheduler, retried by policy, and
//!   recorded when they finish
//! - **Generation fencing**: a workflow reclaimed by recovery gets a new
//!   generation, and every write from an older generation is rejected
//! - **Recovery**: a sweeper reclaims executions whose heartbeat stopped
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      WorkflowRuntime                          │
//! │   (takes due calls from the scheduler, runs recovery sweeps)  │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                           │
//! │  handler ◄── Channel ──► StepExecutor      heartbeat loop     │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │              WorkflowStore          Scheduler                 │
//! │  (PostgreSQL: replay_workflows, replay_journal,               │
//! │               replay_scheduled_calls)                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use everruns_replay::prelude::*;
//!
//! let mut engine = WorkflowEngine::new(store, scheduler);
//! engine.register_workflow_fn("greet", |step, args| async move {
//!     let name: String = step.run("lookup", || async { Ok::<_, String>("ada".to_string()) }).await?;
//!     step.sleep(Duration::from_secs(5)).await?;
//!     let greeting: String = step.call_activity("send_greeting", json!(name)).await?;
//!     Ok(json!(greeting))
//! });
//!
//! let runtime = WorkflowRuntime::new(Arc::new(engine), RuntimeConfig::from_env());
//! runtime.start()?;
//! ```

pub mod activity;
pub mod channel;
pub mod clock;
pub mod engine;
pub mod persistence;
pub mod recovery;
pub mod reliability;
pub mod runtime;
pub mod scheduler;
pub mod workflow;

mod serde_helpers;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::engine::{EngineConfig, EngineError, Invocation, WorkflowEngine};
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowState, WorkflowStore,
    };
    pub use crate::recovery::{RecoveryConfig, RecoverySweeper};
    pub use crate::reliability::RetryPolicy;
    pub use crate::runtime::{RuntimeConfig, RuntimeError, WorkflowRuntime};
    pub use crate::scheduler::{InMemoryScheduler, PostgresScheduler, ScheduledCall, Scheduler};
    pub use crate::workflow::{Outcome, StepContext, StepError, Workflow, WorkflowError};
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use channel::{Channel, ChannelError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineConfig, EngineError, Invocation, WorkflowEngine};
pub use persistence::{
    InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowRecord, WorkflowState,
    WorkflowStore,
};
pub use recovery::{RecoveryConfig, RecoverySweeper};
pub use reliability::RetryPolicy;
pub use runtime::{RuntimeConfig, RuntimeError, RuntimeStatus, WorkflowRuntime};
pub use scheduler::{InMemoryScheduler, PostgresScheduler, ScheduledCall, Scheduler};
pub use workflow::{
    JournalEntry, Outcome, Step, StepContext, StepError, StepType, Workflow, WorkflowError,
};
