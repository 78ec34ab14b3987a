//! Scheduler
//!
//! Validates submissions, persists the pending task, and enqueues the job.
//! The queue is optional: without a configured backend every schedule call
//! fails loudly and only the synchronous path remains usable.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use inkforge_core::{RegistryError, WorkflowRegistry};
use inkforge_storage::{NewTask, StoreError, TaskMode, TaskStatus, TaskStore};

use crate::cancel::CancelHub;
use crate::queue::{EnqueueOptions, Job, JobQueue, QueueError};
use crate::webhook::CallbackOptions;

/// Errors from scheduling operations
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Unknown workflow or invalid parameters
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Store failure
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Queue backend failure
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// No queue backend configured; only sync mode is available
    #[error("queue backend is not configured; async scheduling is unavailable")]
    QueueUnavailable,

    /// Request-level validation failure outside the parameter schema
    #[error("invalid schedule request: {0}")]
    InvalidRequest(String),

    /// Idempotency key reused with different parameters against a live task
    #[error("idempotency key reused with different parameters")]
    IdempotencyConflict,
}

/// An asynchronous scheduling request
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub workflow_type: String,
    pub params: Map<String, Value>,
    pub mode: TaskMode,
    pub priority: Option<u8>,
    pub idempotency_key: Option<String>,
    pub user_id: Option<String>,
    pub schedule_at: Option<DateTime<Utc>>,
    pub callback: Option<CallbackOptions>,
}

impl ScheduleRequest {
    pub fn new(workflow_type: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            params,
            mode: TaskMode::Async,
            priority: None,
            idempotency_key: None,
            user_id: None,
            schedule_at: None,
            callback: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Persists tasks and feeds the queue
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    registry: Arc<WorkflowRegistry>,
    queue: Option<Arc<dyn JobQueue>>,
    hub: Arc<CancelHub>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<WorkflowRegistry>,
        queue: Option<Arc<dyn JobQueue>>,
        hub: Arc<CancelHub>,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            hub,
        }
    }

    /// Whether asynchronous scheduling is available
    pub fn queue_available(&self) -> bool {
        self.queue.is_some()
    }

    /// Validate, persist a pending task, and enqueue its job
    #[instrument(skip(self, request), fields(workflow_type = %request.workflow_type))]
    pub async fn schedule_task(&self, request: ScheduleRequest) -> Result<Uuid, SchedulerError> {
        let queue = self
            .queue
            .as_ref()
            .ok_or(SchedulerError::QueueUnavailable)?;

        if let Some(priority) = request.priority {
            if !(1..=10).contains(&priority) {
                return Err(SchedulerError::InvalidRequest(format!(
                    "priority {priority} outside 1..=10"
                )));
            }
        }
        validate_hard_constraint_bounds(&request.params)?;

        self.registry
            .validate_params(&request.workflow_type, &request.params)?;

        // Sync-mode submissions that still go through the queue jump the line
        let priority = match request.mode {
            TaskMode::Sync => 1,
            TaskMode::Async => request.priority.unwrap_or(5),
        };

        let submitted_params = Value::Object(request.params.clone());
        let mut new_task = NewTask::new(
            request.workflow_type.clone(),
            request.mode,
            submitted_params.clone(),
        )
        .with_priority(priority);
        new_task.idempotency_key = request.idempotency_key.clone();
        new_task.user_id = request.user_id.clone();

        let created = self.store.create_task(new_task).await?;
        let task = created.task;

        if !created.created {
            if task.params != submitted_params {
                return Err(SchedulerError::IdempotencyConflict);
            }
            // Already live; do not enqueue a second delivery
            info!(task_id = %task.id, "idempotency key matched live task");
            return Ok(task.id);
        }

        if !self
            .store
            .update_status(task.id, TaskStatus::Waiting, task.version)
            .await?
        {
            warn!(task_id = %task.id, "could not move fresh task to waiting");
        }

        let delay = request.schedule_at.and_then(|at| {
            let now = Utc::now();
            if at <= now {
                // Past schedule times become immediate jobs
                None
            } else {
                (at - now).to_std().ok()
            }
        });

        let mut job = Job::new(task.id, request.workflow_type.clone(), submitted_params)
            .with_priority(priority);
        if let Some(callback) = request.callback.clone() {
            job = job.with_callback(callback);
        }

        queue
            .enqueue(
                job,
                EnqueueOptions {
                    priority: None,
                    delay,
                },
            )
            .await?;

        info!(task_id = %task.id, priority, "task scheduled");
        Ok(task.id)
    }

    /// Schedule a batch; fails on the first invalid request
    pub async fn schedule_batch_tasks(
        &self,
        requests: Vec<ScheduleRequest>,
    ) -> Result<Vec<Uuid>, SchedulerError> {
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            ids.push(self.schedule_task(request).await?);
        }
        Ok(ids)
    }

    /// Schedule for a future time; past times run immediately
    pub async fn schedule_delayed_task(
        &self,
        mut request: ScheduleRequest,
        schedule_at: DateTime<Utc>,
    ) -> Result<Uuid, SchedulerError> {
        request.schedule_at = Some(schedule_at);
        self.schedule_task(request).await
    }

    /// Cancel a task that has not been leased yet
    ///
    /// Succeeds only from `pending`/`waiting`. A running task is asked to
    /// stop cooperatively through its cancellation token, but the call
    /// reports false; the worker settles the status.
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool, SchedulerError> {
        let task = match self.store.find_by_id(task_id).await? {
            Some(task) => task,
            None => return Ok(false),
        };

        match task.status {
            TaskStatus::Pending | TaskStatus::Waiting => {
                if let Some(queue) = &self.queue {
                    let _ = queue.remove(task_id).await;
                }
                let cancelled = self
                    .store
                    .update_status(task_id, TaskStatus::Cancelled, task.version)
                    .await?;
                if cancelled {
                    info!(task_id = %task_id, "task cancelled before lease");
                }
                Ok(cancelled)
            }
            TaskStatus::Running => {
                let signalled = self.hub.request_cancel(task_id);
                info!(task_id = %task_id, signalled, "cooperative cancel requested");
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

/// Cross-field check the scheduler owns: word-count bounds must be ordered
fn validate_hard_constraint_bounds(params: &Map<String, Value>) -> Result<(), SchedulerError> {
    let Some(constraints) = params.get("hardConstraints").and_then(|v| v.as_object()) else {
        return Ok(());
    };
    let min = constraints.get("minWords").and_then(|v| v.as_u64());
    let max = constraints.get("maxWords").and_then(|v| v.as_u64());
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(SchedulerError::InvalidRequest(format!(
                "minWords ({min}) must not exceed maxWords ({max})"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryJobQueue;
    use inkforge_core::providers::sim::SimLlmProvider;
    use inkforge_core::{register_builtin_workflows, ProviderSet};
    use inkforge_storage::InMemoryTaskStore;
    use serde_json::json;

    fn params() -> Map<String, Value> {
        json!({"topic": "AI", "requirements": "short"})
            .as_object()
            .unwrap()
            .clone()
    }

    fn setup() -> (Scheduler, Arc<InMemoryTaskStore>, Arc<InMemoryJobQueue>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryJobQueue::default());
        let registry = Arc::new(WorkflowRegistry::new());
        register_builtin_workflows(
            &registry,
            ProviderSet::llm_only(Arc::new(SimLlmProvider::fixed("text"))),
        )
        .unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            registry,
            Some(queue.clone()),
            Arc::new(CancelHub::new()),
        );
        (scheduler, store, queue)
    }

    #[tokio::test]
    async fn test_schedule_creates_waiting_task_and_job() {
        let (scheduler, store, queue) = setup();

        let task_id = scheduler
            .schedule_task(ScheduleRequest::new("content-creator", params()))
            .await
            .unwrap();

        let task = store.find_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.priority, 5);
        assert_eq!(queue.stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_no_queue_fails_loudly() {
        let registry = Arc::new(WorkflowRegistry::new());
        let scheduler = Scheduler::new(
            Arc::new(InMemoryTaskStore::new()),
            registry,
            None,
            Arc::new(CancelHub::new()),
        );

        let err = scheduler
            .schedule_task(ScheduleRequest::new("content-creator", params()))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::QueueUnavailable));
    }

    #[tokio::test]
    async fn test_priority_range_enforced() {
        let (scheduler, _store, _queue) = setup();
        let err = scheduler
            .schedule_task(ScheduleRequest::new("content-creator", params()).with_priority(11))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_word_bound_ordering_enforced() {
        let (scheduler, _store, _queue) = setup();
        let mut p = params();
        p.insert(
            "hardConstraints".to_string(),
            json!({"minWords": 300, "maxWords": 100}),
        );
        let err = scheduler
            .schedule_task(ScheduleRequest::new("content-creator", p))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_unknown_workflow_rejected() {
        let (scheduler, _store, queue) = setup();
        let err = scheduler
            .schedule_task(ScheduleRequest::new("ghost", params()))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Registry(_)));
        assert_eq!(queue.stats().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_idempotent_schedule_does_not_double_enqueue() {
        let (scheduler, _store, queue) = setup();

        let first = scheduler
            .schedule_task(
                ScheduleRequest::new("content-creator", params()).with_idempotency_key("k-1"),
            )
            .await
            .unwrap();
        let second = scheduler
            .schedule_task(
                ScheduleRequest::new("content-creator", params()).with_idempotency_key("k-1"),
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_idempotency_conflict_on_different_params() {
        let (scheduler, _store, _queue) = setup();

        scheduler
            .schedule_task(
                ScheduleRequest::new("content-creator", params()).with_idempotency_key("k-1"),
            )
            .await
            .unwrap();

        let mut changed = params();
        changed.insert("topic".to_string(), json!("AI'"));
        let err = scheduler
            .schedule_task(
                ScheduleRequest::new("content-creator", changed).with_idempotency_key("k-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::IdempotencyConflict));
    }

    #[tokio::test]
    async fn test_sync_mode_jumps_the_line() {
        let (scheduler, store, _queue) = setup();
        let mut request = ScheduleRequest::new("content-creator", params());
        request.mode = TaskMode::Sync;

        let task_id = scheduler.schedule_task(request).await.unwrap();
        let task = store.find_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.priority, 1);
    }

    #[tokio::test]
    async fn test_past_schedule_time_is_immediate() {
        let (scheduler, _store, queue) = setup();
        scheduler
            .schedule_delayed_task(
                ScheduleRequest::new("content-creator", params()),
                Utc::now() - chrono::Duration::minutes(5),
            )
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.delayed, 0);
    }

    #[tokio::test]
    async fn test_future_schedule_time_is_delayed() {
        let (scheduler, _store, queue) = setup();
        scheduler
            .schedule_delayed_task(
                ScheduleRequest::new("content-creator", params()),
                Utc::now() + chrono::Duration::minutes(5),
            )
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.delayed, 1);
    }

    #[tokio::test]
    async fn test_cancel_waiting_task() {
        let (scheduler, store, queue) = setup();
        let task_id = scheduler
            .schedule_task(ScheduleRequest::new("content-creator", params()))
            .await
            .unwrap();

        assert!(scheduler.cancel_task(task_id).await.unwrap());
        let task = store.find_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(queue.stats().await.unwrap().waiting, 0);

        // A second cancel is a no-op
        assert!(!scheduler.cancel_task(task_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_scheduling() {
        let (scheduler, _store, queue) = setup();
        let ids = scheduler
            .schedule_batch_tasks(vec![
                ScheduleRequest::new("content-creator", params()),
                ScheduleRequest::new("content-creator", params()).with_priority(2),
            ])
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert_eq!(queue.stats().await.unwrap().waiting, 2);
    }
}
