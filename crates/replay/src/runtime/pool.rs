//! Dispatch pool and background loops

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::poller::CallPoller;
use super::{RuntimeConfig, RuntimeError};
use crate::engine::{EngineError, WorkflowEngine};
use crate::recovery::RecoverySweeper;
use crate::scheduler::DueCall;

/// Runtime status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// Loops are running and taking calls
    Running,
    /// Shutdown signalled; in-flight calls are finishing
    Draining,
    /// Not running
    Stopped,
}

/// Background runtime for a [`WorkflowEngine`]
///
/// # Example
///
/// ```ignore
/// let runtime = WorkflowRuntime::new(Arc::new(engine), RuntimeConfig::from_env());
/// runtime.start()?;
///
/// // ... later, graceful shutdown
/// runtime.shutdown().await?;
/// ```
pub struct WorkflowRuntime {
    engine: Arc<WorkflowEngine>,
    sweeper: Arc<RecoverySweeper>,
    config: RuntimeConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<RuntimeStatus>,
    in_flight: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowRuntime {
    pub fn new(engine: Arc<WorkflowEngine>, config: RuntimeConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let sweeper = Arc::new(RecoverySweeper::for_engine(
            &engine,
            config.recovery.clone(),
        ));

        Self {
            engine,
            sweeper,
            in_flight: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            status: RwLock::new(RuntimeStatus::Stopped),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn sweeper(&self) -> &Arc<RecoverySweeper> {
        &self.sweeper
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.status.read()
    }

    /// Number of calls currently being dispatched
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency - self.in_flight.available_permits()
    }

    /// Spawn the dispatch and sweep loops
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), RuntimeError> {
        {
            let mut status = self.status.write();
            if *status != RuntimeStatus::Stopped {
                return Err(RuntimeError::AlreadyRunning);
            }
            *status = RuntimeStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        info!(
            max_concurrency = self.config.max_concurrency,
            batch_size = self.config.batch_size,
            sweep_interval_ms = self.config.recovery.sweep_interval.as_millis() as u64,
            "starting workflow runtime"
        );

        let mut handles = self.handles.lock();
        handles.push(self.spawn_dispatch_loop());
        handles.push(self.spawn_sweep_loop());
        Ok(())
    }

    /// Stop taking calls and wait for in-flight calls to finish
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        {
            let mut status = self.status.write();
            if *status == RuntimeStatus::Stopped {
                return Ok(());
            }
            *status = RuntimeStatus::Draining;
        }

        info!("initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("runtime loop panicked: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let remaining = self.in_flight();
            if remaining == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "shutdown timeout reached");
                *self.status.write() = RuntimeStatus::Stopped;
                return Err(RuntimeError::ShutdownTimeout(remaining));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        *self.status.write() = RuntimeStatus::Stopped;
        info!("workflow runtime stopped");
        Ok(())
    }

    /// Dispatch everything due right now, one call at a time
    ///
    /// Returns the number of calls dispatched. Used to drive the engine
    /// deterministically without the background loops.
    pub async fn run_due(&self) -> Result<usize, RuntimeError> {
        let mut count = 0;
        loop {
            let now = self.engine.clock().now();
            let due = self
                .engine
                .scheduler()
                .take_due(now, self.config.batch_size)
                .await?;
            if due.is_empty() {
                return Ok(count);
            }
            for call in due {
                count += 1;
                dispatch(&self.engine, call).await;
            }
        }
    }

    fn spawn_dispatch_loop(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let in_flight = Arc::clone(&self.in_flight);
        let mut poller = CallPoller::new(
            Arc::clone(engine.scheduler()),
            Arc::clone(engine.clock()),
            self.config.batch_size,
            self.config.poll_interval,
            self.config.max_poll_interval,
            self.shutdown_tx.subscribe(),
        );

        tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    break;
                }

                let available = in_flight.available_permits();
                if available == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available).await {
                    Ok(calls) => {
                        for call in calls {
                            let permit = match Arc::clone(&in_flight).acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };
                            let engine = Arc::clone(&engine);
                            tokio::spawn(async move {
                                dispatch(&engine, call).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!("poll failed: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("dispatch loop exited");
        })
    }

    fn spawn_sweep_loop(&self) -> JoinHandle<()> {
        let sweeper = Arc::clone(&self.sweeper);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // a zero period would panic the timer
        let interval = self
            .config
            .recovery
            .sweep_interval
            .max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sweeper.sweep().await {
                            error!("recovery sweep failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }

            debug!("sweep loop exited");
        })
    }
}

/// Run one call and acknowledge it unless a retry could succeed
///
/// Transient failures leave the call unacknowledged so the scheduler
/// redelivers it once its lease expires.
async fn dispatch(engine: &WorkflowEngine, due: DueCall) {
    let workflow_id = due.call.workflow_id();
    let kind = due.call.kind();

    let acknowledge = match engine.dispatch(due.call).await {
        Ok(()) => true,
        Err(err) if err.is_fencing() => {
            debug!(%workflow_id, kind, %err, "dropping superseded call");
            true
        }
        Err(err) if err.is_fatal() || is_permanent(&err) => {
            error!(%workflow_id, kind, %err, "call failed permanently");
            true
        }
        Err(err) => {
            warn!(%workflow_id, kind, %err, "call failed, leaving for redelivery");
            false
        }
    };

    if acknowledge {
        if let Err(e) = engine.scheduler().acknowledge(due.id).await {
            error!(call_id = %due.id, "failed to acknowledge call: {}", e);
        }
    }
}

fn is_permanent(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::Registry(_) | EngineError::Serialization(_) | EngineError::Interrupted(_)
    ) || matches!(
        err,
        EngineError::Store(crate::persistence::StoreError::WorkflowNotFound(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowStore, WorkflowStore};
    use crate::scheduler::InMemoryScheduler;
    use uuid::Uuid;

    fn runtime() -> WorkflowRuntime {
        let engine = WorkflowEngine::new(
            Arc::new(InMemoryWorkflowStore::new()),
            Arc::new(InMemoryScheduler::new()),
        );
        WorkflowRuntime::new(Arc::new(engine), RuntimeConfig::default())
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = runtime();
        assert_eq!(runtime.status(), RuntimeStatus::Stopped);

        runtime.start().expect("should start");
        assert_eq!(runtime.status(), RuntimeStatus::Running);
        assert!(matches!(runtime.start(), Err(RuntimeError::AlreadyRunning)));

        runtime.shutdown().await.expect("should shut down");
        assert_eq!(runtime.status(), RuntimeStatus::Stopped);
        assert_eq!(runtime.in_flight(), 0);

        runtime.start().expect("should restart");
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_sweep_interval_still_sweeps() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let engine = WorkflowEngine::new(store.clone(), Arc::new(InMemoryScheduler::new()));
        let id = Uuid::now_v7();
        let now = chrono::Utc::now() - chrono::Duration::seconds(5);
        store.create_workflow(id, "gone", serde_json::json!(null), now).await.unwrap();
        store.start_workflow(id, 0, now).await.unwrap();

        let mut config = RuntimeConfig::default();
        config.recovery.sweep_interval = Duration::ZERO;
        config.recovery.dead_threshold = Duration::from_secs(1);
        let runtime = WorkflowRuntime::new(Arc::new(engine), config);
        runtime.start().expect("should start");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get_workflow(id).await.unwrap().generation == 0 {
            assert!(tokio::time::Instant::now() < deadline, "sweep loop never ran");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        runtime.shutdown().await.expect("should shut down");
    }

    #[tokio::test]
    async fn test_shutdown_when_stopped_is_noop() {
        let runtime = runtime();
        runtime.shutdown().await.unwrap();
        assert_eq!(runtime.status(), RuntimeStatus::Stopped);
    }

    #[tokio::test]
    async fn test_run_due_empty() {
        let runtime = runtime();
        assert_eq!(runtime.run_due().await.unwrap(), 0);
    }
}
