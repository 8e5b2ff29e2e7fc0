//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message, recorded as the step's error outcome once retries run out
    pub message: String,

    /// Error type/code, matched against the retry policy's non-retryable list
    pub error_type: Option<String>,

    /// Whether another attempt may succeed
    pub retryable: bool,
}

impl ActivityError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(err.to_string()).with_type("serialization")
    }
}

/// An activity is a side-effecting call executed outside the workflow
/// invocation
///
/// A workflow calls it through `step.activity::<A>(input)`. The invocation
/// records the call and exits; the runtime later executes the activity,
/// records its outcome and resumes the workflow.
///
/// # Example
///
/// ```ignore
/// use everruns_replay::prelude::*;
///
/// struct SendEmail;
///
/// #[async_trait]
/// impl Activity for SendEmail {
///     const TYPE: &'static str = "send_email";
///     type Input = Email;
///     type Output = String;
///
///     async fn execute(&self, ctx: &ActivityContext, input: Email) -> Result<String, ActivityError> {
///         mailer.send(&input).await.map_err(|e| ActivityError::retryable(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier, recorded as the step handle
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
