//! Registries of workflow and activity handlers
//!
//! Handlers are stored type-erased: every input and output crosses the
//! boundary as JSON, so the engine can resume a workflow knowing only the
//! type name stored in its record.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::reliability::RetryPolicy;
use crate::workflow::{StepContext, Workflow, WorkflowError};

/// Type-erased workflow entry point
pub type WorkflowHandler =
    Arc<dyn Fn(StepContext, Value) -> BoxFuture<'static, Result<Value, WorkflowError>> + Send + Sync>;

/// Type-erased activity body
pub type ActivityHandler = Arc<
    dyn Fn(ActivityContext, Value) -> BoxFuture<'static, Result<Value, ActivityError>> + Send + Sync,
>;

/// Errors from registry lookups
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Activity type not registered
    #[error("unknown activity type: {0}")]
    UnknownActivityType(String),
}

/// Registry of workflow handlers keyed by type name
#[derive(Default)]
pub struct WorkflowRegistry {
    handlers: HashMap<String, WorkflowHandler>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed workflow under `W::TYPE`
    ///
    /// Input that does not decode into `W::Input` fails the workflow with an
    /// error outcome rather than the invocation.
    pub fn register<W: Workflow>(&mut self, workflow: W) {
        let workflow = Arc::new(workflow);
        let handler: WorkflowHandler = Arc::new(move |step: StepContext, input: Value| {
            let workflow = Arc::clone(&workflow);
            async move {
                let input: W::Input = serde_json::from_value(input).map_err(|e| {
                    WorkflowError::new(format!("invalid input for workflow '{}': {e}", W::TYPE))
                        .with_code("invalid_input")
                })?;
                let output = workflow.run(&step, input).await?;
                Ok::<_, WorkflowError>(serde_json::to_value(output)?)
            }
            .boxed()
        });

        self.handlers.insert(W::TYPE.to_string(), handler);
    }

    /// Register a closure as a workflow
    ///
    /// # Example
    ///
    /// ```ignore
    /// registry.register_fn("sum", |step, _args| async move {
    ///     let a: i64 = step.run("a", || async { Ok::<_, String>(2) }).await?;
    ///     Ok(json!(a + 3))
    /// });
    /// ```
    pub fn register_fn<F, Fut>(&mut self, workflow_type: impl Into<String>, f: F)
    where
        F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        let handler: WorkflowHandler = Arc::new(move |step, input| f(step, input).boxed());
        self.handlers.insert(workflow_type.into(), handler);
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.handlers.contains_key(workflow_type)
    }

    /// Look up a handler
    pub fn get(&self, workflow_type: &str) -> Result<WorkflowHandler, RegistryError> {
        self.handlers
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An activity handler with its retry policy
#[derive(Clone)]
pub struct RegisteredActivity {
    pub handler: ActivityHandler,
    pub retry_policy: RetryPolicy,
}

/// Registry of activity handlers keyed by type name
#[derive(Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, RegisteredActivity>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity with the default (single attempt) policy
    pub fn register<A: Activity>(&mut self, activity: A) {
        self.register_with_retry(activity, RetryPolicy::default());
    }

    /// Register a typed activity under `A::TYPE`
    pub fn register_with_retry<A: Activity>(&mut self, activity: A, retry_policy: RetryPolicy) {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(move |ctx: ActivityContext, input: Value| {
            let activity = Arc::clone(&activity);
            async move {
                let input: A::Input = serde_json::from_value(input)?;
                let output = activity.execute(&ctx, input).await?;
                Ok::<_, ActivityError>(serde_json::to_value(output)?)
            }
            .boxed()
        });

        self.activities.insert(
            A::TYPE.to_string(),
            RegisteredActivity {
                handler,
                retry_policy,
            },
        );
    }

    /// Register a closure as an activity
    pub fn register_fn<F, Fut>(
        &mut self,
        activity_type: impl Into<String>,
        retry_policy: RetryPolicy,
        f: F,
    ) where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |ctx, input| f(ctx, input).boxed());
        self.activities.insert(
            activity_type.into(),
            RegisteredActivity {
                handler,
                retry_policy,
            },
        );
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    pub fn get(&self, activity_type: &str) -> Result<RegisteredActivity, RegistryError> {
        self.activities
            .get(activity_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownActivityType(activity_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct DoubleInput {
        value: i64,
    }

    struct Doubler;

    #[async_trait]
    impl Workflow for Doubler {
        const TYPE: &'static str = "doubler";
        type Input = DoubleInput;
        type Output = i64;

        async fn run(&self, _step: &StepContext, input: DoubleInput) -> Result<i64, WorkflowError> {
            Ok(input.value * 2)
        }
    }

    struct Echo;

    #[async_trait]
    impl Activity for Echo {
        const TYPE: &'static str = "echo";
        type Input = String;
        type Output = String;

        async fn execute(
            &self,
            ctx: &ActivityContext,
            input: String,
        ) -> Result<String, ActivityError> {
            Ok(format!("{input}#{}", ctx.attempt))
        }
    }

    fn step_context() -> StepContext {
        StepContext::new(Uuid::now_v7(), 0, Channel::new(0))
    }

    #[tokio::test]
    async fn test_register_and_call_workflow() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Doubler);

        assert!(registry.contains("doubler"));
        assert_eq!(registry.len(), 1);

        let handler = registry.get("doubler").expect("should be registered");
        let output = handler(step_context(), json!({"value": 21})).await.unwrap();
        assert_eq!(output, json!(42));
    }

    #[tokio::test]
    async fn test_invalid_input_fails_workflow() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Doubler);

        let handler = registry.get("doubler").unwrap();
        let err = handler(step_context(), json!({"value": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("invalid_input"));
    }

    #[tokio::test]
    async fn test_register_fn() {
        let mut registry = WorkflowRegistry::new();
        registry.register_fn("constant", |_step, _args| async { Ok(json!("done")) });

        let handler = registry.get("constant").unwrap();
        assert_eq!(handler(step_context(), json!(null)).await.unwrap(), json!("done"));
        assert_eq!(
            registry.get("missing").err(),
            Some(RegistryError::UnknownWorkflowType("missing".into()))
        );
    }

    #[tokio::test]
    async fn test_register_activity() {
        let mut registry = ActivityRegistry::new();
        registry.register_with_retry(Echo, RetryPolicy::exponential());

        let activity = registry.get("echo").unwrap();
        assert_eq!(activity.retry_policy.max_attempts, 5);

        let ctx = ActivityContext::new(Uuid::now_v7(), 0, 0, 2, 5);
        let output = (activity.handler)(ctx, json!("hi")).await.unwrap();
        assert_eq!(output, json!("hi#2"));

        assert!(matches!(
            registry.get("nope"),
            Err(RegistryError::UnknownActivityType(_))
        ));
    }
}
