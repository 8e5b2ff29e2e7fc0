//! Background runtime tests on the in-memory backends with the system clock

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use everruns_replay::prelude::*;
use everruns_replay::RuntimeStatus;
use serde_json::json;
use uuid::Uuid;

fn fast_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_max_poll_interval(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_recovery(
            RecoveryConfig::default()
                .with_sweep_interval(Duration::from_millis(20))
                .with_dead_threshold(Duration::from_millis(100)),
        )
}

async fn wait_for_completion(engine: &WorkflowEngine, id: Uuid) -> Outcome {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(outcome) = engine.status(id).await.unwrap().outcome() {
            return outcome.clone();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow {id} did not complete in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn pipeline_engine(charges: Arc<AtomicUsize>) -> WorkflowEngine {
    let mut engine = WorkflowEngine::new(
        Arc::new(InMemoryWorkflowStore::new()),
        Arc::new(InMemoryScheduler::new()),
    )
    .with_config(EngineConfig::default().with_heartbeat_interval(Duration::from_millis(20)));

    engine.register_workflow_fn("pipeline", |step, args| async move {
        let base: i64 = step
            .run("load", move || async move {
                Ok::<_, String>(args["base"].as_i64().unwrap_or_default())
            })
            .await?;
        step.sleep(Duration::from_millis(30)).await?;
        let charged = step.call_activity("charge", json!(base)).await?;
        Ok::<_, WorkflowError>(json!({"base": base, "charged": charged}))
    });

    engine.register_activity_fn(
        "charge",
        RetryPolicy::fixed(Duration::from_millis(10), 3),
        move |ctx, input| {
            let charges = charges.clone();
            async move {
                charges.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt == 1 {
                    return Err(ActivityError::retryable("gateway timeout"));
                }
                Ok(json!(input.as_i64().unwrap_or_default() * 2))
            }
        },
    );

    engine
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_runtime_drives_workflow_to_completion() {
    let charges = Arc::new(AtomicUsize::new(0));
    let engine = Arc::new(pipeline_engine(charges.clone()));
    let runtime = WorkflowRuntime::new(engine.clone(), fast_config());
    runtime.start().expect("should start");

    let id = engine.start("pipeline", json!({"base": 21})).await.unwrap();
    let outcome = wait_for_completion(&engine, id).await;

    assert_eq!(
        outcome,
        Outcome::success(json!({"base": 21, "charged": 42}))
    );
    assert_eq!(charges.load(Ordering::SeqCst), 2);
    assert_eq!(engine.journal(id).await.unwrap().len(), 3);

    runtime.shutdown().await.expect("should shut down");
    assert_eq!(runtime.status(), RuntimeStatus::Stopped);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_runtime_runs_many_workflows() {
    let charges = Arc::new(AtomicUsize::new(0));
    let engine = Arc::new(pipeline_engine(charges.clone()));
    let runtime = WorkflowRuntime::new(engine.clone(), fast_config().with_max_concurrency(4));
    runtime.start().unwrap();

    let mut ids = Vec::new();
    for base in 0..10 {
        ids.push(engine.start("pipeline", json!({"base": base})).await.unwrap());
    }

    for (base, id) in ids.into_iter().enumerate() {
        let outcome = wait_for_completion(&engine, id).await;
        assert_eq!(
            outcome,
            Outcome::success(json!({"base": base, "charged": base * 2}))
        );
    }
    assert_eq!(charges.load(Ordering::SeqCst), 20);

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_sweep_loop_recovers_dead_execution() {
    let mut engine = WorkflowEngine::new(
        Arc::new(InMemoryWorkflowStore::new()),
        Arc::new(InMemoryScheduler::new()),
    );
    engine.register_workflow_fn("answer", |step, _args| async move {
        let value: i64 = step.run("compute", || async { Ok::<_, String>(42) }).await?;
        Ok::<_, WorkflowError>(json!(value))
    });
    let engine = Arc::new(engine);

    // a workflow left executing by an invocation that no longer exists
    let id = Uuid::now_v7();
    let now = engine.clock().now();
    engine
        .store()
        .create_workflow(id, "answer", json!(null), now)
        .await
        .unwrap();
    engine.store().start_workflow(id, 0, now).await.unwrap();

    let runtime = WorkflowRuntime::new(engine.clone(), fast_config());
    runtime.start().unwrap();

    let outcome = wait_for_completion(&engine, id).await;
    assert_eq!(outcome, Outcome::success(json!(42)));
    assert_eq!(engine.store().get_workflow(id).await.unwrap().generation, 1);

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_shutdown_stops_dispatch() {
    let engine = Arc::new(pipeline_engine(Arc::new(AtomicUsize::new(0))));
    let runtime = WorkflowRuntime::new(engine.clone(), fast_config());
    runtime.start().unwrap();
    runtime.shutdown().await.unwrap();

    let id = engine.start("pipeline", json!({"base": 1})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        engine.status(id).await.unwrap(),
        WorkflowState::Running
    );
    assert!(engine.journal(id).await.unwrap().is_empty());
}
