//! Activity abstractions
//!
//! Activities are side-effecting calls a workflow hands off instead of
//! running inline. They:
//! - Run outside the workflow invocation, dispatched by the scheduler
//! - May fail and be retried according to their retry policy
//! - Complete their journal entry and reschedule the workflow

mod context;
mod definition;

pub use context::ActivityContext;
pub use definition::{Activity, ActivityError};
