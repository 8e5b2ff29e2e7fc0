//! Workflow definitions, the step context and the journal model

mod context;
mod definition;
mod journal;

pub use context::{StepContext, StepError};
pub(crate) use context::{InlineFn, RequestKind, StepRequest};
pub use definition::{Workflow, WorkflowError};
pub use journal::{FunctionType, JournalEntry, Outcome, Step, StepType};
