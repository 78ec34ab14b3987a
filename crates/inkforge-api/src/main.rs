// Inkforge API server
// Decision: providers default to the simulated set so the server runs end-to-end
// without credentials; real LLM/search/image backends are wired in at startup.

mod common;
mod tasks;
mod workflows;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use inkforge_core::providers::sim::{SimImageProvider, SimLlmProvider, SimSearchProvider};
use inkforge_core::{register_builtin_workflows, ProviderSet, WorkflowRegistry};
use inkforge_runtime::{
    connect_queue, CancelHub, JobQueue, ProgressBroker, QueueConfig, QueueMode, Scheduler,
    SyncExecutor, WebhookDispatcher, WebhookDispatcherConfig, Worker, WorkerConfig,
};
use inkforge_storage::{StorageConfig, TaskStore};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<WorkflowRegistry>,
    pub executor: Arc<SyncExecutor>,
    pub scheduler: Arc<Scheduler>,
    pub queue: Option<Arc<dyn JobQueue>>,
    pub hub: Arc<CancelHub>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    queue_available: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        queue_available: state.queue.is_some(),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        tasks::create_task,
        tasks::get_task,
        tasks::get_task_result,
        tasks::cancel_task,
        tasks::queue_stats,
        workflows::list_workflows,
        workflows::get_workflow,
    ),
    components(
        schemas(
            tasks::CreateTaskRequest,
            tasks::CreateTaskResponse,
            tasks::TaskStatusResponse,
            tasks::TaskResultResponse,
            tasks::ResultRow,
            tasks::CancelResponse,
            workflows::WorkflowDetail,
            inkforge_core::WorkflowMetadata,
        )
    ),
    tags(
        (name = "tasks", description = "Task submission, status, results, cancellation"),
        (name = "workflows", description = "Registered workflow metadata"),
        (name = "queue", description = "Queue visibility")
    ),
    info(
        title = "Inkforge API",
        version = "0.3.0",
        description = "Durable orchestrator for multi-step content pipelines",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

/// Build the default provider bundle (simulated backends)
fn build_providers() -> ProviderSet {
    ProviderSet::llm_only(Arc::new(SimLlmProvider::fixed(
        r#"{"score": 8.0, "dimensions": {"relevance": 8}, "suggestions": []}"#,
    )))
    .with_search(Arc::new(SimSearchProvider::generic()))
    .with_image(Arc::new(SimImageProvider::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkforge_api=debug,inkforge_runtime=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _ = dotenvy::dotenv();
    tracing::info!("inkforge-api starting...");

    // Storage
    let storage_config = StorageConfig::from_env()
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("invalid storage configuration")?;
    let store = inkforge_storage::connect(&storage_config)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("failed to open task store")?;

    // Workflows
    let registry = WorkflowRegistry::global().clone();
    register_builtin_workflows(&registry, build_providers())
        .context("failed to register built-in workflows")?;

    // Queue (optional)
    let queue_mode = QueueMode::from_env()
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("invalid queue configuration")?;
    let queue = connect_queue(&queue_mode, QueueConfig::default())
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("failed to open job queue")?;

    let progress = Arc::new(ProgressBroker::new());
    let hub = Arc::new(CancelHub::new());
    let webhook = Arc::new(WebhookDispatcher::new(WebhookDispatcherConfig::default()));

    let executor = Arc::new(
        SyncExecutor::new(
            store.clone(),
            registry.clone(),
            progress.clone(),
            hub.clone(),
        )
        .with_webhook(webhook.clone()),
    );
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        registry.clone(),
        queue.clone(),
        hub.clone(),
    ));

    // Embedded worker: convenient for the in-memory queue, optional otherwise
    let embedded_worker = std::env::var("WORKER_EMBEDDED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(queue_mode == QueueMode::Memory);
    let shutdown = CancellationToken::new();
    if embedded_worker {
        if let Some(queue) = queue.clone() {
            tracing::info!("starting embedded worker");
            let worker = Arc::new(
                Worker::new(
                    store.clone(),
                    registry.clone(),
                    queue,
                    progress.clone(),
                    hub.clone(),
                    WorkerConfig::default(),
                )
                .with_webhook(webhook.clone()),
            );
            tokio::spawn(worker.run(shutdown.clone()));
        }
    }

    let state = AppState {
        store,
        registry,
        executor,
        scheduler,
        queue,
        hub,
    };

    let health_routes = Router::new()
        .route("/health", get(health))
        .with_state(state.clone());

    let app = Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(health_routes)
        .merge(tasks::routes(state.clone()))
        .merge(workflows::routes(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("INKFORGE_API_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app)
        .await
        .context("server exited with an error")?;

    shutdown.cancel();
    Ok(())
}
