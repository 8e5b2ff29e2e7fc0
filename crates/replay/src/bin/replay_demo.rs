// Replay demo
//
// Runs a handful of order workflows through the engine: an inline step, a
// durable sleep, a flaky activity with retries, and a final inline step.
// Uses PostgreSQL when DATABASE_URL is set, in-memory backends otherwise.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use everruns_replay::prelude::*;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "replay-demo")]
#[command(about = "Run sample workflows on the journaled replay engine")]
#[command(version)]
struct Cli {
    /// PostgreSQL connection string; in-memory backends when absent
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Number of workflows to start
    #[arg(long, short, default_value_t = 3)]
    workflows: u32,

    /// Length of the durable sleep in each workflow, in milliseconds
    #[arg(long, default_value_t = 500)]
    sleep_ms: u64,

    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("everruns_replay=debug,replay_demo=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let (store, scheduler): (Arc<dyn WorkflowStore>, Arc<dyn Scheduler>) =
        match &cli.database_url {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                let store = PostgresWorkflowStore::new(pool.clone());
                store.migrate().await.context("Failed to run migrations")?;
                tracing::info!("using PostgreSQL backends");
                (Arc::new(store), Arc::new(PostgresScheduler::new(pool)))
            }
            None => {
                tracing::info!("using in-memory backends");
                (
                    Arc::new(InMemoryWorkflowStore::new()),
                    Arc::new(InMemoryScheduler::new()),
                )
            }
        };

    let mut engine =
        WorkflowEngine::new(store, scheduler).with_config(EngineConfig::from_env());
    register(&mut engine, Duration::from_millis(cli.sleep_ms));
    let engine = Arc::new(engine);

    let config = RuntimeConfig::from_env().with_max_poll_interval(Duration::from_millis(200));
    let runtime = WorkflowRuntime::new(Arc::clone(&engine), config);
    runtime.start()?;

    let mut ids = Vec::new();
    for order in 0..cli.workflows {
        let id = engine
            .start("fulfil_order", json!({"order": order, "amount": 10 + order * 5}))
            .await?;
        ids.push(id);
    }

    let waited = tokio::select! {
        result = wait_for_all(&engine, &ids, Duration::from_secs(cli.timeout_secs)) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
    };

    runtime.shutdown().await?;
    waited?;

    for id in &ids {
        let state = engine.status(*id).await?;
        match state.outcome() {
            Some(Outcome::Success { result }) => println!("{id}: {result}"),
            Some(Outcome::Error { message }) => println!("{id}: failed: {message}"),
            None => println!("{id}: {state}"),
        }
    }

    Ok(())
}

fn register(engine: &mut WorkflowEngine, nap: Duration) {
    engine.register_workflow_fn("fulfil_order", move |step, args| async move {
        let order = args["order"].as_u64().unwrap_or_default();
        let amount = args["amount"].as_u64().unwrap_or_default();

        let reservation: String = step
            .run("reserve_stock", move || async move {
                Ok::<_, String>(format!("reservation-{order}"))
            })
            .await?;

        step.sleep(nap).await?;

        let charge = step
            .call_activity("charge_card", json!({"order": order, "amount": amount}))
            .await?;

        let receipt: String = step
            .run("receipt", move || async move {
                Ok::<_, String>(format!("{reservation} charged {}", charge["charged"]))
            })
            .await?;

        Ok::<_, WorkflowError>(json!(receipt))
    });

    engine.register_activity_fn(
        "charge_card",
        RetryPolicy::exponential()
            .with_max_attempts(3)
            .with_initial_interval(Duration::from_millis(100)),
        |ctx, input| async move {
            // first attempt always times out
            if ctx.attempt == 1 {
                return Err(ActivityError::retryable("payment gateway timeout"));
            }
            Ok(json!({"charged": input["amount"], "attempt": ctx.attempt}))
        },
    );
}

async fn wait_for_all(engine: &WorkflowEngine, ids: &[Uuid], timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut pending = 0;
        for id in ids {
            if !engine.status(*id).await?.is_completed() {
                pending += 1;
            }
        }
        if pending == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("{pending} workflows still running after {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
