use std::sync::Arc;

use anyhow::{Context, Result};
use metronome_scheduler::Scheduler;
use metronome_storage::{PostgresWorkStore, WorkQueue};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    metronome_observability::init_tracing("metronome_scheduler=debug");

    tracing::info!("metronome-scheduler starting...");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let store = PostgresWorkStore::from_url(&database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection established");

    let queue = WorkQueue::new(Arc::new(store));
    let scheduler = Arc::new(Scheduler::new(queue));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
    run_handle.await?.context("scheduler loop failed")?;

    Ok(())
}
