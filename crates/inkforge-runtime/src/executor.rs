//! Synchronous executor
//!
//! Drives a single workflow to completion in the caller's process: create
//! the task (idempotently), claim it, step the graph with checkpointing and
//! progress, and persist the outcome. A submission whose idempotency key
//! matches a live task joins it (observes until completion) rather than
//! running it a second time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use inkforge_core::{RegistryError, RunRecorder, WorkflowRegistry};
use inkforge_storage::{
    NewTask, NewTaskResult, StoreError, Task, TaskMode, TaskStatus, TaskStore,
};

use crate::cancel::CancelHub;
use crate::driver::{DriverConfig, GraphDriver, RunOutcome};
use crate::error::{FailureKind, RunFailure};
use crate::progress::{ProgressBroker, ProgressEvent};
use crate::recorder::StoreRecorder;
use crate::webhook::{CallbackOptions, WebhookDispatcher, WebhookEvent, WebhookEventKind};

/// Executor configuration
#[derive(Debug, Clone)]
pub struct SyncExecutorConfig {
    /// Deadline for the whole run (and for joining an existing run)
    pub total_timeout: Duration,

    /// Poll interval while joining an existing task
    pub join_poll_interval: Duration,
}

impl Default for SyncExecutorConfig {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_secs(300),
            join_poll_interval: Duration::from_millis(200),
        }
    }
}

/// Errors surfaced to the caller before a run settles
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Unknown workflow or invalid parameters
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Store failure
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Idempotency key reused with different parameters against a live task
    #[error("idempotency key reused with different parameters")]
    IdempotencyConflict,
}

/// Terminal status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Aggregated run accounting
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetadata {
    pub steps_completed: Vec<String>,
    pub tokens_used: i64,
    pub cost: f64,
}

/// The outcome handed back to the caller
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub task_id: Uuid,
    pub status: ExecutionStatus,
    pub final_state: Option<Value>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
    pub metadata: ExecutionMetadata,
}

/// A synchronous execution request
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub workflow_type: String,
    pub params: Map<String, Value>,
    pub idempotency_key: Option<String>,
    pub user_id: Option<String>,
    pub task_id: Option<Uuid>,
    pub callback: Option<CallbackOptions>,
}

impl ExecuteRequest {
    pub fn new(workflow_type: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            params,
            idempotency_key: None,
            user_id: None,
            task_id: None,
            callback: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_callback(mut self, callback: CallbackOptions) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// End-to-end in-process driver
pub struct SyncExecutor {
    store: Arc<dyn TaskStore>,
    registry: Arc<WorkflowRegistry>,
    progress: Arc<ProgressBroker>,
    hub: Arc<CancelHub>,
    driver: GraphDriver,
    webhook: Option<Arc<WebhookDispatcher>>,
    config: SyncExecutorConfig,
}

impl SyncExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<WorkflowRegistry>,
        progress: Arc<ProgressBroker>,
        hub: Arc<CancelHub>,
    ) -> Self {
        let driver = GraphDriver::new(store.clone(), progress.clone());
        Self {
            store,
            registry,
            progress,
            hub,
            driver,
            webhook: None,
            config: SyncExecutorConfig::default(),
        }
    }

    pub fn with_webhook(mut self, webhook: Arc<WebhookDispatcher>) -> Self {
        self.webhook = Some(webhook);
        self
    }

    pub fn with_config(mut self, config: SyncExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_driver_config(mut self, config: DriverConfig) -> Self {
        self.driver = GraphDriver::new(self.store.clone(), self.progress.clone())
            .with_config(config);
        self
    }

    /// The progress broker callers subscribe through
    pub fn progress(&self) -> &Arc<ProgressBroker> {
        &self.progress
    }

    /// Request cooperative cancellation of a running task
    ///
    /// The runtime observes the signal between steps; the task transitions
    /// to `cancelled` once the run settles.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let signalled = self.hub.request_cancel(task_id);
        if signalled {
            self.progress.remove_progress_callbacks(task_id);
        }
        signalled
    }

    /// Execute a workflow to completion
    #[instrument(skip(self, request), fields(workflow_type = %request.workflow_type))]
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecutionResult, ExecutorError> {
        let started = Instant::now();

        self.registry
            .validate_params(&request.workflow_type, &request.params)?;

        let submitted_params = Value::Object(request.params.clone());
        let mut new_task = NewTask::new(
            request.workflow_type.clone(),
            TaskMode::Sync,
            submitted_params.clone(),
        )
        .with_priority(1);
        new_task.id = request.task_id;
        new_task.idempotency_key = request.idempotency_key.clone();
        new_task.user_id = request.user_id.clone();

        let created = self.store.create_task(new_task).await?;
        let task = created.task;

        if !created.created {
            if task.params != submitted_params {
                return Err(ExecutorError::IdempotencyConflict);
            }
            info!(task_id = %task.id, "joining existing task for idempotency key");
            return self.join_existing(task.id, started).await;
        }

        let worker_id = format!("sync-{}", task.id);
        if !self.store.claim_task(task.id, &worker_id, task.version).await? {
            // Another submitter won the claim; observe their run
            return self.join_existing(task.id, started).await;
        }
        let version = task.version + 1;

        let state = self.registry.create_state(
            &request.workflow_type,
            task.id,
            &TaskMode::Sync.to_string(),
            &request.params,
        )?;
        let graph = self.registry.create_graph(&request.workflow_type)?;

        let cancel = self.hub.register(task.id);
        let recorder: Arc<dyn RunRecorder> = Arc::new(StoreRecorder::new(self.store.clone()));

        let run = self
            .driver
            .run(task.id, version, &graph, state, cancel.clone(), recorder);

        let outcome = match tokio::time::timeout(self.config.total_timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(RunFailure::new(
                    FailureKind::TotalTimeout,
                    format!("run exceeded {:?}", self.config.total_timeout),
                ))
            }
        };

        self.hub.deregister(task.id);

        let result = match outcome {
            Ok(run_outcome) => self.finalize_success(&task, run_outcome, started).await?,
            Err(failure) => self.finalize_failure(&task, failure, started).await?,
        };

        self.progress.remove_progress_callbacks(task.id);
        self.emit_webhook(&task, &result, request.callback.as_ref());
        Ok(result)
    }

    async fn finalize_success(
        &self,
        task: &Task,
        outcome: RunOutcome,
        started: Instant,
    ) -> Result<ExecutionResult, ExecutorError> {
        persist_results(self.store.as_ref(), task.id, &outcome.state).await?;

        if !self
            .store
            .mark_as_completed(task.id, outcome.task_version)
            .await?
        {
            // The row moved under us (e.g. a cancel landed first); re-read
            // and surface whatever stuck.
            warn!(task_id = %task.id, "completion CAS lost, re-reading task");
            if let Some(fresh) = self.store.find_by_id(task.id).await? {
                if fresh.status == TaskStatus::Cancelled {
                    return Ok(ExecutionResult {
                        task_id: task.id,
                        status: ExecutionStatus::Cancelled,
                        final_state: Some(outcome.state.to_value()),
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: Some(RunFailure::new(
                            FailureKind::Cancelled,
                            "cancelled at completion",
                        )),
                        metadata: self.collect_metadata(task.id, outcome.steps_completed.clone()).await,
                    });
                }
                if !fresh.status.is_terminal() {
                    self.store.mark_as_completed(task.id, fresh.version).await?;
                }
            }
        }

        self.progress.notify(&ProgressEvent {
            task_id: task.id,
            current_step: "completed".to_string(),
            percentage: 100,
            message: "workflow completed".to_string(),
        });

        let metadata = self
            .collect_metadata(task.id, outcome.steps_completed.clone())
            .await;

        info!(task_id = %task.id, steps = outcome.steps_completed.len(), "task completed");
        Ok(ExecutionResult {
            task_id: task.id,
            status: ExecutionStatus::Completed,
            final_state: Some(outcome.state.to_value()),
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
            metadata,
        })
    }

    async fn finalize_failure(
        &self,
        task: &Task,
        failure: RunFailure,
        started: Instant,
    ) -> Result<ExecutionResult, ExecutorError> {
        let fresh = self.store.find_by_id(task.id).await?;
        let version = fresh.as_ref().map(|t| t.version).unwrap_or(task.version);

        let status = if failure.kind == FailureKind::Cancelled {
            self.store
                .update_status(task.id, TaskStatus::Cancelled, version)
                .await?;
            ExecutionStatus::Cancelled
        } else {
            self.store
                .mark_as_failed(task.id, &failure.task_error_message(), version)
                .await?;
            ExecutionStatus::Failed
        };

        warn!(task_id = %task.id, kind = failure.kind.as_str(), "task did not complete");
        let metadata = self.collect_metadata(task.id, vec![]).await;
        Ok(ExecutionResult {
            task_id: task.id,
            status,
            final_state: fresh.and_then(|t| t.state_snapshot),
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(failure),
            metadata,
        })
    }

    /// Observe an already-running task until it settles
    async fn join_existing(
        &self,
        task_id: Uuid,
        started: Instant,
    ) -> Result<ExecutionResult, ExecutorError> {
        loop {
            if started.elapsed() > self.config.total_timeout {
                return Ok(ExecutionResult {
                    task_id,
                    status: ExecutionStatus::Failed,
                    final_state: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(RunFailure::new(
                        FailureKind::TotalTimeout,
                        "joined task did not settle in time",
                    )),
                    metadata: ExecutionMetadata::default(),
                });
            }

            let task = self.store.find_by_id(task_id).await?;
            if let Some(task) = task {
                if task.status.is_terminal() {
                    let status = match task.status {
                        TaskStatus::Completed => ExecutionStatus::Completed,
                        TaskStatus::Cancelled => ExecutionStatus::Cancelled,
                        _ => ExecutionStatus::Failed,
                    };
                    let error = task.error_message.as_deref().map(parse_task_error);
                    let steps = self
                        .store
                        .list_checkpoints(task_id)
                        .await?
                        .into_iter()
                        .map(|c| c.step_name)
                        .collect();
                    let metadata = self.collect_metadata(task_id, steps).await;
                    return Ok(ExecutionResult {
                        task_id,
                        status,
                        final_state: task.state_snapshot,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error,
                        metadata,
                    });
                }
            }

            tokio::time::sleep(self.config.join_poll_interval).await;
        }
    }

    async fn collect_metadata(
        &self,
        task_id: Uuid,
        steps_completed: Vec<String>,
    ) -> ExecutionMetadata {
        let (tokens_used, cost) = match self.store.get_token_usage(task_id).await {
            Ok(records) => records.iter().fold((0, 0.0), |(tokens, cost), r| {
                (tokens + r.input_tokens + r.output_tokens, cost + r.cost)
            }),
            Err(_) => (0, 0.0),
        };
        ExecutionMetadata {
            steps_completed,
            tokens_used,
            cost,
        }
    }

    fn emit_webhook(
        &self,
        task: &Task,
        result: &ExecutionResult,
        callback: Option<&CallbackOptions>,
    ) {
        let (Some(webhook), Some(callback)) = (&self.webhook, callback) else {
            return;
        };

        let (kind, status) = match result.status {
            ExecutionStatus::Completed => (WebhookEventKind::TaskCompleted, "completed"),
            ExecutionStatus::Failed => (WebhookEventKind::TaskFailed, "failed"),
            ExecutionStatus::Cancelled => (WebhookEventKind::TaskCancelled, "cancelled"),
        };

        let mut event = WebhookEvent::new(kind, task.id, task.workflow_type.clone(), status);
        if let Some(state) = &result.final_state {
            if let Some(results) = state.get("results") {
                event = event.with_result(results.clone());
            }
        }
        if let Some(error) = &result.error {
            event = event.with_error(error.kind.as_str(), &error.message);
        }
        webhook.send(event, callback);
    }
}

/// Persist the `results` channel of a final state as result rows
pub async fn persist_results(
    store: &dyn TaskStore,
    task_id: Uuid,
    state: &inkforge_core::WorkflowState,
) -> Result<(), StoreError> {
    let entries = match state.get("results").and_then(|v| v.as_array()) {
        Some(entries) => entries.clone(),
        None => return Ok(()),
    };

    for entry in entries {
        let result_type = entry
            .get("result_type")
            .and_then(|v| v.as_str())
            .unwrap_or("artifact")
            .to_string();
        store
            .add_result(NewTaskResult {
                task_id,
                result_type,
                content: entry
                    .get("content")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                file_path: entry
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                metadata: entry.get("metadata").cloned(),
            })
            .await?;
    }
    Ok(())
}

/// Rebuild a run failure from the persisted task error message
fn parse_task_error(message: &str) -> RunFailure {
    match message.split_once(": ") {
        Some((kind, rest)) => match FailureKind::parse(kind) {
            Some(kind) => RunFailure::new(kind, rest),
            None => RunFailure::new(FailureKind::NodeFailed, message),
        },
        None => RunFailure::new(FailureKind::NodeFailed, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_error_round_trip() {
        let failure = RunFailure::new(FailureKind::QualityExhausted, "budget spent");
        let parsed = parse_task_error(&failure.task_error_message());
        assert_eq!(parsed.kind, FailureKind::QualityExhausted);

        let parsed = parse_task_error("free-form message");
        assert_eq!(parsed.kind, FailureKind::NodeFailed);
    }
}
