//! Step context handed to workflow handlers
//!
//! Every `step.*` call becomes a [`StepRequest`] sent over the invocation's
//! rendezvous channel, and resolves when the step executor replies with the
//! recorded (or freshly produced) outcome.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::activity::Activity;
use crate::channel::Channel;
use crate::engine::EngineError;
use crate::workflow::Outcome;

/// Error returned by a step to the workflow handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// The step ran and recorded an error outcome
    #[error("{0}")]
    Failed(String),

    /// The recorded result does not decode into the requested type
    #[error("failed to decode step result: {0}")]
    Decode(String),

    /// The step arguments could not be serialized
    #[error("failed to encode step arguments: {0}")]
    Encode(String),

    /// The invocation ended before the step resolved
    ///
    /// The handler should return promptly; nothing it does afterwards is
    /// recorded.
    #[error("invocation ended before the step resolved")]
    Interrupted,
}

impl StepError {
    /// Short machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Closure body of an inline step, boxed for the channel
pub(crate) type InlineFn =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<serde_json::Value, String>> + Send>;

/// What the handler asked for
pub(crate) enum RequestKind {
    /// Run a closure inside this invocation
    Inline { label: String, run: InlineFn },

    /// Hand a registered activity off to the scheduler
    Activity {
        activity_type: String,
        input: serde_json::Value,
    },

    /// Suspend until the duration has elapsed
    Sleep { duration: Duration },
}

impl RequestKind {
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Inline { label, .. } => format!("inline '{label}'"),
            Self::Activity { activity_type, .. } => format!("activity '{activity_type}'"),
            Self::Sleep { duration } => format!("sleep {}ms", duration.as_millis()),
        }
    }
}

/// A step request travelling from the handler to the step executor
pub(crate) struct StepRequest {
    pub kind: RequestKind,
    pub reply: oneshot::Sender<Result<serde_json::Value, StepError>>,
}

impl StepRequest {
    /// Resolve the handler's pending step with an outcome
    pub(crate) fn resolve(
        reply: oneshot::Sender<Result<serde_json::Value, StepError>>,
        outcome: Outcome,
    ) {
        // The handler may already be gone if the invocation is tearing down.
        let _ = reply.send(outcome.into_result().map_err(StepError::Failed));
    }
}

/// Handle through which a workflow issues durable steps
///
/// Cheap to clone; all clones talk to the same invocation.
#[derive(Clone)]
pub struct StepContext {
    workflow_id: Uuid,
    generation: u64,
    channel: Channel<StepRequest, EngineError>,
    interrupted: Arc<AtomicBool>,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("workflow_id", &self.workflow_id)
            .field("generation", &self.generation)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

impl StepContext {
    pub(crate) fn new(
        workflow_id: Uuid,
        generation: u64,
        channel: Channel<StepRequest, EngineError>,
    ) -> Self {
        Self {
            workflow_id,
            generation,
            channel,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Workflow being executed
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Generation of the current invocation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a step of this invocation was cut off
    ///
    /// Once set, the engine discards whatever the handler returns.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Run `f` as a journaled step named `label`
    ///
    /// The closure runs at most once per successful invocation; on replay the
    /// recorded value (or error message) is returned without calling it.
    pub async fn run<T, E, F, Fut>(&self, label: impl Into<String>, f: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: std::fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let run: InlineFn = Box::new(move || {
            async move {
                match f().await {
                    Ok(value) => serde_json::to_value(value).map_err(|e| e.to_string()),
                    Err(err) => Err(err.to_string()),
                }
            }
            .boxed()
        });

        let value = self
            .request(RequestKind::Inline {
                label: label.into(),
                run,
            })
            .await?;
        decode(value)
    }

    /// Call a registered activity by type
    ///
    /// The invocation suspends while the activity runs elsewhere and resumes
    /// with its outcome.
    pub async fn call_activity(
        &self,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, StepError> {
        self.request(RequestKind::Activity {
            activity_type: activity_type.into(),
            input,
        })
        .await
    }

    /// Call a typed activity
    pub async fn activity<A: Activity>(&self, input: A::Input) -> Result<A::Output, StepError> {
        let input = serde_json::to_value(input).map_err(|e| StepError::Encode(e.to_string()))?;
        let value = self.call_activity(A::TYPE, input).await?;
        decode(value)
    }

    /// Durably sleep for `duration`
    ///
    /// The duration must be positive.
    pub async fn sleep(&self, duration: Duration) -> Result<(), StepError> {
        self.request(RequestKind::Sleep { duration }).await?;
        Ok(())
    }

    async fn request(&self, kind: RequestKind) -> Result<serde_json::Value, StepError> {
        if self.is_interrupted() {
            return Err(StepError::Interrupted);
        }

        let (reply, response) = oneshot::channel();
        if self.channel.send(StepRequest { kind, reply }).await.is_err() {
            return Err(self.interrupt());
        }

        match response.await {
            Ok(result) => result,
            Err(_) => Err(self.interrupt()),
        }
    }

    fn interrupt(&self) -> StepError {
        self.interrupted.store(true, Ordering::Release);
        StepError::Interrupted
    }
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, StepError> {
    serde_json::from_value(value).map_err(|e| StepError::Decode(e.to_string()))
}
