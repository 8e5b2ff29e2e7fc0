//! Workflow trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{StepContext, StepError};

/// Error type for workflow failures
///
/// Only `message` is persisted in the workflow's outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling (not persisted)
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

impl From<StepError> for WorkflowError {
    fn from(err: StepError) -> Self {
        match &err {
            StepError::Failed(message) => Self::new(message.clone()),
            _ => Self::new(err.to_string()).with_code(err.code()),
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_code("serialization")
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A workflow is ordinary sequential async code whose side effects go
/// through a [`StepContext`]
///
/// Every `step.*` call is journaled. When the invocation resumes after a
/// suspension or a crash, the handler runs again from the top and every step
/// already in the journal returns its recorded outcome instead of executing.
///
/// # Determinism
///
/// Given the same input and the same recorded outcomes, a handler must issue
/// the same sequence of steps. Anything non-deterministic (clock reads, random
/// numbers, I/O) belongs inside a step.
///
/// # Example
///
/// ```ignore
/// use everruns_replay::prelude::*;
///
/// struct ReportWorkflow;
///
/// #[async_trait]
/// impl Workflow for ReportWorkflow {
///     const TYPE: &'static str = "report";
///     type Input = ReportInput;
///     type Output = String;
///
///     async fn run(&self, step: &StepContext, input: ReportInput) -> Result<String, WorkflowError> {
///         let rows: Vec<Row> = step.activity::<FetchRows>(input.query).await?;
///         step.sleep(Duration::from_secs(60)).await?;
///         let total = step.run("sum", move || async move { Ok::<_, String>(sum(&rows)) }).await?;
///         Ok(format!("total: {total}"))
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// Stored with every workflow record and used to find the handler on resume.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Run the workflow from the top
    async fn run(
        &self,
        step: &StepContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_from_failed_step_keeps_message() {
        let err: WorkflowError = StepError::Failed("upstream refused".into()).into();
        assert_eq!(err.message, "upstream refused");
        assert!(err.code.is_none());
    }

    #[test]
    fn test_workflow_error_from_interrupted_step() {
        let err: WorkflowError = StepError::Interrupted.into();
        assert_eq!(err.code.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_workflow_error_with_code() {
        let err = WorkflowError::new("bad input").with_code("VALIDATION");
        assert_eq!(err.to_string(), "bad input");
        assert_eq!(err.code, Some("VALIDATION".to_string()));
    }
}
