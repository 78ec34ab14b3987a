// Inkforge standalone worker
//
// Leases jobs from the configured queue and drives workflow graphs. Requires
// a queue backend; without one the process exits with a clear error.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use inkforge_core::providers::sim::{SimImageProvider, SimLlmProvider, SimSearchProvider};
use inkforge_core::{register_builtin_workflows, ProviderSet, WorkflowRegistry};
use inkforge_runtime::{
    connect_queue, CancelHub, ProgressBroker, QueueConfig, QueueMode, WebhookDispatcher,
    WebhookDispatcherConfig, Worker, WorkerConfig,
};
use inkforge_storage::StorageConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkforge_worker=debug,inkforge_runtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _ = dotenvy::dotenv();
    tracing::info!("inkforge-worker starting...");

    let storage_config = StorageConfig::from_env()
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("invalid storage configuration")?;
    let store = inkforge_storage::connect(&storage_config)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("failed to open task store")?;

    let registry = WorkflowRegistry::global().clone();
    let providers = ProviderSet::llm_only(Arc::new(SimLlmProvider::fixed(
        r#"{"score": 8.0, "dimensions": {"relevance": 8}, "suggestions": []}"#,
    )))
    .with_search(Arc::new(SimSearchProvider::generic()))
    .with_image(Arc::new(SimImageProvider::new()));
    register_builtin_workflows(&registry, providers)
        .context("failed to register built-in workflows")?;

    let queue_mode = QueueMode::from_env()
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("invalid queue configuration")?;
    if queue_mode == QueueMode::None {
        bail!("QUEUE_URL is not set; a worker needs a queue backend");
    }
    let queue = match connect_queue(&queue_mode, QueueConfig::default())
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("failed to open job queue")?
    {
        Some(queue) => queue,
        None => bail!("queue backend resolved to none"),
    };

    let concurrency = std::env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);
    let mut config = WorkerConfig::default().with_concurrency(concurrency);
    if let Ok(worker_id) = std::env::var("WORKER_ID") {
        config = config.with_worker_id(worker_id);
    }

    let webhook = Arc::new(WebhookDispatcher::new(WebhookDispatcherConfig::default()));
    let worker = Arc::new(
        Worker::new(
            store,
            registry,
            queue.clone(),
            Arc::new(ProgressBroker::new()),
            Arc::new(CancelHub::new()),
            config,
        )
        .with_webhook(webhook),
    );

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, draining");
    shutdown.cancel();
    queue.close().await;
    handle.await.context("worker task panicked")?;

    Ok(())
}
