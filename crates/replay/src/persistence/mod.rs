//! Persistence layer for workflow records and journals
//!
//! This module provides:
//! - [`WorkflowStore`] trait with generation-checked atomic operations
//! - [`InMemoryWorkflowStore`] for testing
//! - [`PostgresWorkflowStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub use store::{
    check_append, check_completion, StoreError, WorkflowRecord, WorkflowState, WorkflowStore,
};
