//! Queue worker
//!
//! Leases jobs, claims their tasks (the CAS that makes at-least-once
//! delivery safe), and drives the same graph logic as the synchronous
//! executor. Retryable failures are nacked back to the queue; fatal ones
//! settle the task. A job whose task is already handled is acked and
//! skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use inkforge_core::{RunRecorder, WorkflowRegistry, WorkflowState};
use inkforge_storage::{RetryKind, TaskStatus, TaskStore};

use crate::cancel::CancelHub;
use crate::driver::{DriverConfig, GraphDriver};
use crate::error::{FailureKind, RunFailure};
use crate::executor::persist_results;
use crate::progress::ProgressBroker;
use crate::queue::{JobQueue, LeasedJob, NackOutcome};
use crate::recorder::StoreRecorder;
use crate::webhook::{WebhookDispatcher, WebhookEvent, WebhookEventKind};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent graph runs
    pub concurrency: usize,

    /// How often orphaned leases from a previous incarnation are released
    pub reclaim_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            concurrency: 4,
            reclaim_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// A leased queue worker
pub struct Worker {
    store: Arc<dyn TaskStore>,
    registry: Arc<WorkflowRegistry>,
    queue: Arc<dyn JobQueue>,
    progress: Arc<ProgressBroker>,
    hub: Arc<CancelHub>,
    webhook: Option<Arc<WebhookDispatcher>>,
    driver: Arc<GraphDriver>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<WorkflowRegistry>,
        queue: Arc<dyn JobQueue>,
        progress: Arc<ProgressBroker>,
        hub: Arc<CancelHub>,
        config: WorkerConfig,
    ) -> Self {
        let driver = Arc::new(GraphDriver::new(store.clone(), progress.clone()));
        Self {
            store,
            registry,
            queue,
            progress,
            hub,
            webhook: None,
            driver,
            config,
        }
    }

    pub fn with_webhook(mut self, webhook: Arc<WebhookDispatcher>) -> Self {
        self.webhook = Some(webhook);
        self
    }

    pub fn with_driver_config(mut self, config: DriverConfig) -> Self {
        self.driver = Arc::new(
            GraphDriver::new(self.store.clone(), self.progress.clone()).with_config(config),
        );
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until shutdown; drains in-flight work before returning
    #[instrument(skip(self, shutdown), fields(worker_id = %self.config.worker_id))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(concurrency = self.config.concurrency, "worker starting");
        self.release_orphaned_leases().await;

        let reclaimer = {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(worker.config.reclaim_interval) => {
                            worker.release_orphaned_leases().await;
                        }
                    }
                }
            })
        };

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        loop {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let leased = tokio::select! {
                _ = shutdown.cancelled() => {
                    drop(permit);
                    break;
                }
                leased = self.queue.lease(&self.config.worker_id) => leased,
            };

            match leased {
                Ok(Some(leased)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process_job(leased).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    debug!("queue closed, worker leaving the lease loop");
                    drop(permit);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "lease failed, backing off");
                    drop(permit);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        // Drain: every permit back means every spawned run settled
        let _ = semaphore
            .acquire_many(self.config.concurrency as u32)
            .await;
        reclaimer.abort();
        info!("worker stopped");
    }

    /// Release leases this worker id holds but is not actually executing
    /// (left over from a crashed previous incarnation)
    async fn release_orphaned_leases(&self) {
        let tasks = match self
            .store
            .get_active_tasks_by_worker(&self.config.worker_id)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "orphan scan failed");
                return;
            }
        };

        for task in tasks {
            if self.hub.is_registered(task.id) {
                continue;
            }
            warn!(task_id = %task.id, "releasing orphaned lease");
            let _ = self
                .store
                .release_worker(task.id, &self.config.worker_id, task.version)
                .await;
        }
    }

    #[instrument(skip(self, leased), fields(task_id = %leased.job.task_id, attempt = leased.job.attempt_count))]
    async fn process_job(&self, leased: LeasedJob) {
        let job = &leased.job;

        let task = match self.store.find_by_id(job.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!("job references a missing task, acking");
                let _ = self.queue.ack(&leased).await;
                return;
            }
            Err(e) => {
                error!(error = %e, "task load failed, nacking");
                let _ = self.queue.nack(&leased, &e.to_string()).await;
                return;
            }
        };

        if task.status.is_terminal() {
            debug!(status = %task.status, "task already settled, acking");
            let _ = self.queue.ack(&leased).await;
            return;
        }

        // A workflow unregistered between enqueue and lease is fatal
        if self.registry.get_optional(&job.workflow_type).is_none() {
            let failure = RunFailure::new(
                FailureKind::UnknownWorkflow,
                format!("workflow type not registered: {}", job.workflow_type),
            );
            let _ = self
                .store
                .mark_as_failed(task.id, &failure.task_error_message(), task.version)
                .await;
            let _ = self.queue.ack(&leased).await;
            self.emit_terminal(&leased, WebhookEventKind::TaskFailed, "failed", Some(&failure), None);
            return;
        }

        // Crash recovery: a running task with a stale holder is released and
        // re-claimed, then resumed from its latest checkpoint.
        let mut task = task;
        if task.status == TaskStatus::Running {
            if self.hub.is_registered(task.id) {
                // This process is already driving the task; the lease timed
                // out under a slow run and the queue redelivered it
                debug!("duplicate delivery for an active run, acking");
                let _ = self.queue.ack(&leased).await;
                return;
            }
            if let Some(stale_holder) = task.worker_id.clone() {
                if stale_holder != self.config.worker_id {
                    info!(stale_holder = %stale_holder, "releasing stale worker lease");
                }
                if self
                    .store
                    .release_worker(task.id, &stale_holder, task.version)
                    .await
                    .unwrap_or(false)
                {
                    match self.store.find_by_id(task.id).await {
                        Ok(Some(fresh)) => task = fresh,
                        _ => {
                            let _ = self.queue.nack(&leased, "task re-read failed").await;
                            return;
                        }
                    }
                }
            }
        }

        if !self
            .store
            .claim_task(task.id, &self.config.worker_id, task.version)
            .await
            .unwrap_or(false)
        {
            // Someone else holds the task; duplicate delivery neutralized
            debug!("claim lost, acking duplicate delivery");
            let _ = self.queue.ack(&leased).await;
            return;
        }
        let mut version = task.version + 1;

        // Queue-level redeliveries count as graph-level retries
        if job.attempt_count > 1
            && self
                .store
                .increment_retry_count(task.id, RetryKind::Graph, version)
                .await
                .unwrap_or(false)
        {
            version += 1;
        }

        let graph = match self.registry.create_graph(&job.workflow_type) {
            Ok(graph) => graph,
            Err(e) => {
                let failure = RunFailure::new(FailureKind::UnknownWorkflow, e.to_string());
                let _ = self
                    .store
                    .mark_as_failed(task.id, &failure.task_error_message(), version)
                    .await;
                let _ = self.queue.ack(&leased).await;
                self.emit_terminal(&leased, WebhookEventKind::TaskFailed, "failed", Some(&failure), None);
                return;
            }
        };

        let state = match self.build_state(&leased).await {
            Ok(state) => state,
            Err(failure) => {
                let _ = self
                    .store
                    .mark_as_failed(task.id, &failure.task_error_message(), version)
                    .await;
                let _ = self.queue.ack(&leased).await;
                self.emit_terminal(&leased, WebhookEventKind::TaskFailed, "failed", Some(&failure), None);
                return;
            }
        };

        self.register_progress_webhook(&leased);

        let cancel = self.hub.register(task.id);
        let recorder: Arc<dyn RunRecorder> = Arc::new(StoreRecorder::new(self.store.clone()));
        let outcome = self
            .driver
            .run(task.id, version, &graph, state, cancel, recorder)
            .await;

        self.hub.deregister(task.id);
        self.progress.remove_progress_callbacks(task.id);

        match outcome {
            Ok(run) => {
                if let Err(e) = persist_results(self.store.as_ref(), task.id, &run.state).await {
                    error!(error = %e, "result persistence failed, nacking for retry");
                    let _ = self.release_for_retry(task.id).await;
                    let _ = self.queue.nack(&leased, &e.to_string()).await;
                    return;
                }

                if !self
                    .store
                    .mark_as_completed(task.id, run.task_version)
                    .await
                    .unwrap_or(false)
                {
                    warn!("completion CAS lost after run");
                }
                let _ = self.queue.ack(&leased).await;
                let results = run.state.get("results").cloned();
                self.emit_terminal(&leased, WebhookEventKind::TaskCompleted, "completed", None, results);
                info!(steps = run.steps_completed.len(), "task completed");
            }

            Err(failure) if failure.kind == FailureKind::Cancelled => {
                if let Ok(Some(fresh)) = self.store.find_by_id(task.id).await {
                    let _ = self
                        .store
                        .update_status(task.id, TaskStatus::Cancelled, fresh.version)
                        .await;
                }
                let _ = self.queue.ack(&leased).await;
                self.emit_terminal(&leased, WebhookEventKind::TaskCancelled, "cancelled", Some(&failure), None);
            }

            Err(failure) if failure.kind.is_retryable() => {
                warn!(kind = failure.kind.as_str(), error = %failure.message, "retryable failure, nacking");
                let _ = self.release_for_retry(task.id).await;
                match self.queue.nack(&leased, &failure.task_error_message()).await {
                    Ok(NackOutcome::Discarded) => {
                        // Queue gave up; settle the task
                        if let Ok(Some(fresh)) = self.store.find_by_id(task.id).await {
                            let _ = self
                                .store
                                .mark_as_failed(task.id, &failure.task_error_message(), fresh.version)
                                .await;
                        }
                        self.emit_terminal(&leased, WebhookEventKind::TaskFailed, "failed", Some(&failure), None);
                    }
                    Ok(NackOutcome::WillRetry { attempt, delay }) => {
                        debug!(attempt, ?delay, "redelivery scheduled");
                    }
                    Err(e) => error!(error = %e, "nack failed"),
                }
            }

            Err(failure) => {
                if let Ok(Some(fresh)) = self.store.find_by_id(task.id).await {
                    let _ = self
                        .store
                        .mark_as_failed(task.id, &failure.task_error_message(), fresh.version)
                        .await;
                }
                let _ = self.queue.ack(&leased).await;
                self.emit_terminal(&leased, WebhookEventKind::TaskFailed, "failed", Some(&failure), None);
            }
        }
    }

    /// Restore from the latest checkpoint, or build fresh state
    async fn build_state(&self, leased: &LeasedJob) -> Result<WorkflowState, RunFailure> {
        let job = &leased.job;

        match self.store.load_latest_checkpoint(job.task_id).await {
            Ok(Some(checkpoint)) => match WorkflowState::from_value(checkpoint.state) {
                Ok(state) => {
                    info!(step = %checkpoint.step_name, "resuming from checkpoint");
                    return Ok(state);
                }
                Err(e) => {
                    warn!(error = %e, "checkpoint unreadable, starting fresh");
                }
            },
            Ok(None) => {}
            Err(e) => return Err(e.into()),
        }

        let params = job
            .params
            .as_object()
            .cloned()
            .unwrap_or_default();
        self.registry
            .create_state(&job.workflow_type, job.task_id, "async", &params)
            .map_err(|e| RunFailure::new(FailureKind::InvalidParams, e.to_string()))
    }

    /// Clear our lease so a redelivered job can re-claim the task
    async fn release_for_retry(&self, task_id: Uuid) {
        if let Ok(Some(fresh)) = self.store.find_by_id(task_id).await {
            let _ = self
                .store
                .release_worker(task_id, &self.config.worker_id, fresh.version)
                .await;
        }
    }

    /// Forward progress events as `task.progress` webhooks
    fn register_progress_webhook(&self, leased: &LeasedJob) {
        let (Some(webhook), Some(callback)) = (&self.webhook, &leased.job.callback) else {
            return;
        };

        let webhook = webhook.clone();
        let callback = callback.clone();
        let workflow_type = leased.job.workflow_type.clone();
        self.progress.on_progress(
            leased.job.task_id,
            Arc::new(move |event| {
                let payload = WebhookEvent::new(
                    WebhookEventKind::TaskProgress,
                    event.task_id,
                    workflow_type.clone(),
                    "running",
                )
                .with_metadata(serde_json::json!({
                    "current_step": event.current_step,
                    "percentage": event.percentage,
                }));
                webhook.send(payload, &callback);
            }),
        );
    }

    fn emit_terminal(
        &self,
        leased: &LeasedJob,
        kind: WebhookEventKind,
        status: &str,
        failure: Option<&RunFailure>,
        results: Option<serde_json::Value>,
    ) {
        let (Some(webhook), Some(callback)) = (&self.webhook, &leased.job.callback) else {
            return;
        };

        let mut event = WebhookEvent::new(
            kind,
            leased.job.task_id,
            leased.job.workflow_type.clone(),
            status,
        );
        if let Some(failure) = failure {
            event = event.with_error(failure.kind.as_str(), &failure.message);
        }
        if let Some(results) = results {
            event = event.with_result(results);
        }
        webhook.send(event, callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverConfig;
    use crate::queue::{EnqueueOptions, InMemoryJobQueue, Job, QueueConfig};
    use crate::retry::RetryPolicy;
    use crate::scheduler::{ScheduleRequest, Scheduler};
    use inkforge_core::providers::sim::{SimImageProvider, SimLlmProvider, SimSearchProvider};
    use inkforge_core::{register_builtin_workflows, ProviderSet};
    use inkforge_storage::{InMemoryTaskStore, NewTask, TaskMode};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        queue: Arc<InMemoryJobQueue>,
        registry: Arc<WorkflowRegistry>,
        hub: Arc<CancelHub>,
        worker: Arc<Worker>,
    }

    fn fixture_with_llm(llm: SimLlmProvider) -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(QueueConfig {
            lease_timeout: Duration::from_secs(5),
            retry: RetryPolicy::exponential()
                .with_max_attempts(3)
                .with_initial_interval(Duration::from_millis(10))
                .with_max_interval(Duration::from_millis(20))
                .with_jitter(0.0),
            ..Default::default()
        }));
        let registry = Arc::new(WorkflowRegistry::new());
        let providers = ProviderSet::llm_only(Arc::new(llm))
            .with_search(Arc::new(SimSearchProvider::generic()))
            .with_image(Arc::new(SimImageProvider::new()));
        register_builtin_workflows(&registry, providers).unwrap();

        let hub = Arc::new(CancelHub::new());
        let worker = Arc::new(
            Worker::new(
                store.clone(),
                registry.clone(),
                queue.clone(),
                Arc::new(ProgressBroker::new()),
                hub.clone(),
                WorkerConfig::default()
                    .with_worker_id("w-test")
                    .with_concurrency(2),
            )
            .with_driver_config(DriverConfig {
                node_retry_base: Duration::from_millis(5),
            }),
        );

        Fixture {
            store,
            queue,
            registry,
            hub,
            worker,
        }
    }

    /// LLM whose judge always passes
    fn passing_llm() -> SimLlmProvider {
        SimLlmProvider::fixed(r#"{"score": 9.0, "suggestions": []}"#)
    }

    fn params() -> serde_json::Map<String, serde_json::Value> {
        json!({"topic": "AI", "requirements": "short"})
            .as_object()
            .unwrap()
            .clone()
    }

    async fn wait_for_terminal(
        store: &InMemoryTaskStore,
        task_id: Uuid,
        timeout: Duration,
    ) -> inkforge_storage::Task {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = store.find_by_id(task_id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task never settled: {:?}",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_worker_completes_scheduled_task() {
        let f = fixture_with_llm(passing_llm());
        let scheduler = Scheduler::new(
            f.store.clone(),
            f.registry.clone(),
            Some(f.queue.clone()),
            f.hub.clone(),
        );

        let task_id = scheduler
            .schedule_task(ScheduleRequest::new("content-creator", params()))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.worker.clone().run(shutdown.clone()));

        let task = wait_for_terminal(&f.store, task_id, Duration::from_secs(10)).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.worker_id.is_none());
        assert!(task.completed_at.is_some());

        let results = f.store.get_results(task_id).await.unwrap();
        assert!(results.iter().any(|r| r.result_type == "article"));

        shutdown.cancel();
        f.queue.close().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_workflow_fails_fatally() {
        let f = fixture_with_llm(passing_llm());

        let task = f
            .store
            .create_task(NewTask::new("ghost-workflow", TaskMode::Async, json!({})))
            .await
            .unwrap()
            .task;
        f.queue
            .enqueue(
                Job::new(task.id, "ghost-workflow", json!({})),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.worker.clone().run(shutdown.clone()));

        let task = wait_for_terminal(&f.store, task.id, Duration::from_secs(5)).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("UnknownWorkflow"));

        // Fatal: no redelivery happened
        assert_eq!(f.queue.stats().await.unwrap().completed, 1);

        shutdown.cancel();
        f.queue.close().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_neutralized_by_claim() {
        let f = fixture_with_llm(passing_llm());

        let task = f
            .store
            .create_task(NewTask::new("content-creator", TaskMode::Async, json!(params())))
            .await
            .unwrap()
            .task;

        // The task is already completed elsewhere
        assert!(f.store.claim_task(task.id, "other", 1).await.unwrap());
        assert!(f.store.mark_as_completed(task.id, 2).await.unwrap());

        f.queue
            .enqueue(
                Job::new(task.id, "content-creator", json!(params())),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.worker.clone().run(shutdown.clone()));

        // Job is acked without re-running anything
        for _ in 0..100 {
            if f.queue.stats().await.unwrap().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.queue.stats().await.unwrap().completed, 1);
        assert_eq!(
            f.store.list_checkpoints(task.id).await.unwrap().len(),
            0
        );

        shutdown.cancel();
        f.queue.close().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_recovery_resumes_from_checkpoint() {
        let f = fixture_with_llm(passing_llm());

        // A task a crashed worker left RUNNING with a stale holder and one
        // committed checkpoint
        let task = f
            .store
            .create_task(NewTask::new("content-creator", TaskMode::Async, json!(params())))
            .await
            .unwrap()
            .task;
        assert!(f.store.claim_task(task.id, "w-dead", 1).await.unwrap());

        let registry_state = f
            .registry
            .create_state("content-creator", task.id, "async", &params())
            .unwrap();
        let mut state = registry_state;
        state.insert("research", json!([{"title": "done"}]));
        state.set_current_step("research");
        state.bump_version();
        let version = f
            .store
            .save_checkpoint(task.id, "research", state.to_value(), 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version, 3);

        // The queue lease expired and the job is redelivered to our worker
        f.queue
            .enqueue(
                Job::new(task.id, "content-creator", json!(params())),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.worker.clone().run(shutdown.clone()));

        let task = wait_for_terminal(&f.store, task.id, Duration::from_secs(10)).await;
        assert_eq!(task.status, TaskStatus::Completed);

        // The resumed run never re-ran the checkpointed step
        let checkpoints = f.store.list_checkpoints(task.id).await.unwrap();
        let research_count = checkpoints
            .iter()
            .filter(|c| c.step_name == "research")
            .count();
        assert_eq!(research_count, 1);

        shutdown.cancel();
        f.queue.close().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_quality_exhaustion_is_fatal() {
        // Judge always fails the draft; no suggestions ever fix it
        let f = fixture_with_llm(SimLlmProvider::fixed(
            r#"{"score": 1.0, "suggestions": ["rewrite"]}"#,
        ));
        let scheduler = Scheduler::new(
            f.store.clone(),
            f.registry.clone(),
            Some(f.queue.clone()),
            f.hub.clone(),
        );

        let mut p = params();
        p.insert("maxTextRetries".to_string(), json!(3));
        let task_id = scheduler
            .schedule_task(ScheduleRequest::new("content-creator", p))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.worker.clone().run(shutdown.clone()));

        let task = wait_for_terminal(&f.store, task_id, Duration::from_secs(10)).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("QualityExhausted"));

        // The retry budget was spent exactly
        let latest = f
            .store
            .load_latest_checkpoint(task_id)
            .await
            .unwrap()
            .unwrap();
        let state = WorkflowState::from_value(latest.state).unwrap();
        assert_eq!(state.counter("text_retry_count"), 3);

        shutdown.cancel();
        f.queue.close().await;
        handle.await.unwrap();
    }
}
