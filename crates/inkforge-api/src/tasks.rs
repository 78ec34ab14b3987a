//! Task HTTP routes

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use inkforge_runtime::{CallbackOptions, ExecuteRequest, ScheduleRequest};
use inkforge_storage::{TaskMode, TaskStatus};

use crate::common::ApiError;
use crate::AppState;

/// Request to create or submit a task
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTaskRequest {
    pub workflow_type: String,

    /// "sync" runs in-request; "async" (default) goes through the queue
    #[serde(default)]
    pub mode: Option<String>,

    #[schema(value_type = Object)]
    pub params: Map<String, Value>,

    pub idempotency_key: Option<String>,

    /// 1..=10, 1 highest; defaults to 5
    pub priority: Option<u8>,

    /// ISO-8601 start time; past times run immediately
    pub schedule_at: Option<String>,

    #[schema(value_type = Object)]
    pub callback: Option<CallbackOptions>,

    pub user_id: Option<String>,
}

/// Response to a task submission
#[derive(Debug, Serialize, ToSchema)]
pub struct CreateTaskResponse {
    pub task_id: Uuid,
    pub status: String,
}

/// Task status view
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskStatusResponse {
    pub task_id: Uuid,
    pub status: String,
    pub current_step: Option<String>,
    /// Coarse completion estimate in [0, 100]
    pub progress: u8,
    pub workflow_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One produced artifact
#[derive(Debug, Serialize, ToSchema)]
pub struct ResultRow {
    pub result_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub metadata: Option<Value>,
}

/// Task results view
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskResultResponse {
    pub task_id: Uuid,
    pub results: Vec<ResultRow>,
}

/// Cancellation outcome
#[derive(Debug, Serialize, ToSchema)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Create task routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/tasks", post(create_task))
        .route("/v1/tasks/:task_id", get(get_task))
        .route("/v1/tasks/:task_id/result", get(get_task_result))
        .route("/v1/tasks/:task_id/cancel", post(cancel_task))
        .route("/v1/queue/stats", get(queue_stats))
        .with_state(state)
}

/// POST /v1/tasks - Submit a workflow task
#[utoipa::path(
    post,
    path = "/v1/tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 200, description = "Task accepted (or joined via idempotency key)", body = CreateTaskResponse),
        (status = 400, description = "Invalid parameters"),
        (status = 404, description = "Unknown workflow"),
        (status = 409, description = "Idempotency conflict"),
        (status = 503, description = "Queue unavailable for async mode"),
    ),
    tag = "tasks"
)]
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<CreateTaskResponse>, ApiError> {
    let mode = match request.mode.as_deref() {
        None | Some("async") => TaskMode::Async,
        Some("sync") => TaskMode::Sync,
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "mode must be 'sync' or 'async', got '{other}'"
            )))
        }
    };

    let schedule_at = request
        .schedule_at
        .as_deref()
        .map(|raw| {
            raw.parse::<DateTime<Utc>>()
                .map_err(|_| ApiError::BadRequest(format!("schedule_at is not ISO-8601: {raw}")))
        })
        .transpose()?;

    match mode {
        TaskMode::Sync => {
            let mut exec_request =
                ExecuteRequest::new(request.workflow_type.clone(), request.params.clone());
            exec_request.idempotency_key = request.idempotency_key.clone();
            exec_request.user_id = request.user_id.clone();
            exec_request.callback = request.callback.clone();

            let result = state.executor.execute(exec_request).await?;
            Ok(Json(CreateTaskResponse {
                task_id: result.task_id,
                status: serde_json::to_value(result.status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "completed".to_string()),
            }))
        }
        TaskMode::Async => {
            let mut schedule = ScheduleRequest::new(request.workflow_type.clone(), request.params);
            schedule.priority = request.priority;
            schedule.idempotency_key = request.idempotency_key;
            schedule.user_id = request.user_id;
            schedule.schedule_at = schedule_at;
            schedule.callback = request.callback;

            let task_id = state.scheduler.schedule_task(schedule).await?;
            let status = state
                .store
                .find_by_id(task_id)
                .await?
                .map(|t| t.status.to_string())
                .unwrap_or_else(|| TaskStatus::Waiting.to_string());

            Ok(Json(CreateTaskResponse { task_id, status }))
        }
    }
}

/// GET /v1/tasks/{task_id} - Task status
#[utoipa::path(
    get,
    path = "/v1/tasks/{task_id}",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task found", body = TaskStatusResponse),
        (status = 404, description = "Task not found"),
    ),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let task = state
        .store
        .find_by_id(task_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let progress = match task.status {
        TaskStatus::Completed => 100,
        TaskStatus::Pending | TaskStatus::Waiting => 0,
        _ => {
            // Committed steps against the graph's node count
            let committed = state.store.list_checkpoints(task_id).await?.len();
            let total = state
                .registry
                .get_optional(&task.workflow_type)
                .and_then(|f| f.build_graph().ok())
                .map(|g| g.node_count().max(1))
                .unwrap_or(1);
            ((committed * 100 / total).min(99)) as u8
        }
    };

    Ok(Json(TaskStatusResponse {
        task_id: task.id,
        status: task.status.to_string(),
        current_step: task.current_step,
        progress,
        workflow_type: task.workflow_type,
        created_at: task.created_at,
        started_at: task.started_at,
        completed_at: task.completed_at,
        error_message: task.error_message,
    }))
}

/// GET /v1/tasks/{task_id}/result - Task results
#[utoipa::path(
    get,
    path = "/v1/tasks/{task_id}/result",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Results", body = TaskResultResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task has not completed yet"),
    ),
    tag = "tasks"
)]
pub async fn get_task_result(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResultResponse>, ApiError> {
    let task = state
        .store
        .find_by_id(task_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if task.status != TaskStatus::Completed {
        return Err(ApiError::NotReady);
    }

    let results = state
        .store
        .get_results(task_id)
        .await?
        .into_iter()
        .map(|r| ResultRow {
            result_type: r.result_type,
            content: r.content,
            file_path: r.file_path,
            metadata: r.metadata,
        })
        .collect();

    Ok(Json(TaskResultResponse { task_id, results }))
}

/// POST /v1/tasks/{task_id}/cancel - Cancel a task
#[utoipa::path(
    post,
    path = "/v1/tasks/{task_id}/cancel",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Cancellation outcome", body = CancelResponse),
        (status = 404, description = "Task not found"),
    ),
    tag = "tasks"
)]
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    let task = state
        .store
        .find_by_id(task_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let cancelled = match task.status {
        TaskStatus::Pending | TaskStatus::Waiting => {
            state.scheduler.cancel_task(task_id).await?
        }
        // Cooperative: the run observes the signal at its next step
        TaskStatus::Running => state.hub.request_cancel(task_id),
        _ => false,
    };

    Ok(Json(CancelResponse { cancelled }))
}

/// GET /v1/queue/stats - Queue depth counters
#[utoipa::path(
    get,
    path = "/v1/queue/stats",
    responses(
        (status = 200, description = "Queue stats"),
        (status = 503, description = "No queue configured"),
    ),
    tag = "queue"
)]
pub async fn queue_stats(
    State(state): State<AppState>,
) -> Result<Json<inkforge_runtime::QueueStats>, ApiError> {
    let queue = state.queue.as_ref().ok_or(ApiError::QueueUnavailable)?;
    let stats = queue
        .stats()
        .await
        .map_err(|e| ApiError::Storage(e.to_string()))?;
    Ok(Json(stats))
}
