//! Workflow execution engine
//!
//! [`WorkflowEngine`] runs one invocation of a workflow at a time: it claims
//! the workflow, replays its journal through the step executor while the
//! handler runs, and records whatever ends the invocation (completion, a
//! sleep, an activity handoff).

mod orchestrator;
mod registry;
mod replayer;

use crate::channel::ChannelError;
use crate::persistence::StoreError;
use crate::scheduler::SchedulerError;

pub use orchestrator::{EngineConfig, Invocation, WorkflowEngine};
pub use registry::{
    ActivityHandler, ActivityRegistry, RegisteredActivity, RegistryError, WorkflowHandler,
    WorkflowRegistry,
};
pub use replayer::ReplayError;

/// Errors from engine operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduler error
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Journal and handler disagree
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Channel error
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The invocation was cut off before reaching a definitive result
    #[error("invocation interrupted: {0}")]
    Interrupted(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// The invocation lost ownership of the workflow; drop it quietly
    pub fn is_fencing(&self) -> bool {
        match self {
            Self::Store(e) => e.is_fencing(),
            _ => false,
        }
    }

    /// Retrying cannot help: the handler is nondeterministic or the journal
    /// is corrupt
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Replay(_) => true,
            Self::Store(e) => e.is_integrity(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
