// Metronome API server: Task CRUD, Run reads, Event publication
//
// The facade writes task and event rows; the scheduler and workers pick
// them up through the store. It never writes due-work rows or runs itself
// (run_now goes through the queue's admission checks).

mod common;
mod events;
mod runs;
mod tasks;
mod workers;

use anyhow::{Context, Result};
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use metronome_observability::Metrics;
use metronome_storage::{PostgresWorkStore, WorkQueue, WorkStore};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Clone)]
struct MetricsState {
    metrics: Metrics,
}

async fn export_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    match state.metrics.export() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("metrics export failed: {}", e);
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        tasks::create_task,
        tasks::list_tasks,
        tasks::get_task,
        tasks::update_task,
        tasks::pause_task,
        tasks::resume_task,
        tasks::cancel_task,
        tasks::snooze_task,
        tasks::run_now,
        runs::list_runs,
        runs::get_run,
        runs::list_task_runs,
        events::publish_event,
        workers::list_workers,
    ),
    components(
        schemas(
            tasks::CreateTaskRequest,
            tasks::UpdateTaskRequest,
            tasks::TaskResponse,
            tasks::SnoozeRequest,
            tasks::RunNowRequest,
            tasks::RunNowResponse,
            runs::RunResponse,
            events::PublishEventRequest,
            events::PublishEventResponse,
            workers::WorkerResponse,
            common::ListResponse<tasks::TaskResponse>,
            common::ListResponse<runs::RunResponse>,
            common::ListResponse<workers::WorkerResponse>,
        )
    ),
    tags(
        (name = "tasks", description = "Task management endpoints"),
        (name = "runs", description = "Run history endpoints"),
        (name = "events", description = "Event publication endpoints"),
        (name = "workers", description = "Worker observability endpoints")
    ),
    info(
        title = "Metronome API",
        version = "0.2.0",
        description = "API for managing scheduled tasks, their runs, and events",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    metronome_observability::init_tracing("metronome_api=debug,tower_http=debug");

    tracing::info!("metronome-api starting...");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let store = PostgresWorkStore::from_url(&database_url)
        .await
        .context("Failed to connect to database")?;
    store.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Connected to database, migrations applied");

    let store: Arc<dyn WorkStore> = Arc::new(store);
    let queue = WorkQueue::new(store.clone());
    let metrics = Metrics::new();

    let tasks_state = tasks::AppState {
        store: store.clone(),
        queue: queue.clone(),
        metrics: metrics.clone(),
    };
    let runs_state = runs::AppState {
        store: store.clone(),
    };
    let events_state = events::AppState {
        store: store.clone(),
    };
    let workers_state = workers::AppState {
        store: store.clone(),
    };
    let metrics_state = MetricsState { metrics };

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(export_metrics).with_state(metrics_state))
        .merge(tasks::routes(tasks_state))
        .merge(runs::routes(runs_state))
        .merge(events::routes(events_state))
        .merge(workers::routes(workers_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("METRONOME_API_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
