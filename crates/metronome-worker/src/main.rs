use std::sync::Arc;

use anyhow::{Context, Result};
use metronome_engine::{PipelineExecutor, ToolRegistry};
use metronome_observability::Metrics;
use metronome_storage::{PostgresWorkStore, WorkQueue};
use metronome_worker::Worker;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    metronome_observability::init_tracing("metronome_worker=debug");

    tracing::info!("metronome-worker starting...");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let store = PostgresWorkStore::from_url(&database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection established");

    let queue = WorkQueue::new(Arc::new(store));
    let executor = PipelineExecutor::new(Arc::new(ToolRegistry::builtin()));
    let metrics = Metrics::new();

    // Cooperative pipeline executions within this process; one by default,
    // horizontal scaling is normally more worker processes.
    let fan_out: usize = std::env::var("METRONOME_WORKER_FAN_OUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
        .max(1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(fan_out);
    for slot in 0..fan_out {
        let worker = Arc::new(Worker::new(queue.clone(), executor.clone(), metrics.clone()));
        tracing::info!(worker_id = %worker.worker_id(), slot, "worker initialized");
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown_rx).await }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, draining");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        handle.await?;
    }

    Ok(())
}
