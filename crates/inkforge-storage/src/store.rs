//! TaskStore trait definition
//!
//! The repository is the sole authority on task `version`; no caller computes
//! the next version itself. Every mutating operation is linearizable per task
//! id: of concurrent writers, at most one succeeds and the losers observe
//! `false` (or `None`) with no side effects.
//!
//! Precondition failures (version mismatch, wrong lease holder, invalid
//! status transition) are results, not errors. [`StoreError`] is reserved
//! for storage-level failures.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    Checkpoint, CreatedTask, NewTask, NewTaskResult, Pagination, QualityCheckRecord, RetryKind,
    Task, TaskFilter, TaskResult, TaskStatus, TokenUsageRecord,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem error (embedded backend)
    #[error("io error: {0}")]
    Io(String),
}

/// Input for a token-usage record
#[derive(Debug, Clone)]
pub struct NewTokenUsage {
    pub task_id: Uuid,
    pub step_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
}

/// Input for a quality-check record
#[derive(Debug, Clone)]
pub struct NewQualityCheck {
    pub task_id: Uuid,
    pub step_name: String,
    pub passed: bool,
    pub score: f64,
    pub report: Value,
}

/// Durable storage for tasks, results, checkpoints, and token usage
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Create a task with `version = 1` and status `pending`
    ///
    /// When an idempotency key is supplied and a non-terminal task already
    /// maps to it, the existing task is returned with `created = false` and
    /// no new row is written.
    async fn create_task(&self, input: NewTask) -> Result<CreatedTask, StoreError>;

    /// Fetch a task by id (excludes soft-deleted tasks)
    async fn find_by_id(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Fetch the live (non-terminal) task for an idempotency key
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>, StoreError>;

    /// List a user's tasks, newest first
    async fn find_by_user(
        &self,
        user_id: &str,
        page: Pagination,
    ) -> Result<Vec<Task>, StoreError>;

    /// List tasks matching a filter, newest first
    async fn find_many(
        &self,
        filter: TaskFilter,
        page: Pagination,
    ) -> Result<Vec<Task>, StoreError>;

    /// Count tasks matching a filter
    async fn count(&self, filter: TaskFilter) -> Result<u64, StoreError>;

    /// CAS status transition; also maintains timestamp fields
    ///
    /// Returns `false` on version mismatch, missing task, or an invalid
    /// transition (e.g. out of a terminal status).
    async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// CAS update of the current step name
    async fn update_current_step(
        &self,
        task_id: Uuid,
        step: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// CAS increment of one of the retry counters
    async fn increment_retry_count(
        &self,
        task_id: Uuid,
        kind: RetryKind,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// CAS write of the opaque state snapshot on the task row
    async fn save_state_snapshot(
        &self,
        task_id: Uuid,
        snapshot: Value,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// Atomically grant a worker the exclusive right to advance a task
    ///
    /// Succeeds from `pending`/`waiting`, or from `running` with no lease
    /// holder (a crashed worker's lease that was released). Sets `running`,
    /// the worker id, and `started_at`, and bumps the version.
    async fn claim_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// Clear the lease, but only when `worker_id` currently holds it
    async fn release_worker(
        &self,
        task_id: Uuid,
        worker_id: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// CAS terminal success (`running -> completed`, sets `completed_at`)
    async fn mark_as_completed(
        &self,
        task_id: Uuid,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// CAS terminal failure from any non-terminal status
    ///
    /// The error message must already be sanitized by the caller.
    async fn mark_as_failed(
        &self,
        task_id: Uuid,
        error_message: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// CAS soft delete; the task disappears from reads but remains on disk
    async fn soft_delete(&self, task_id: Uuid, expected_version: i64)
        -> Result<bool, StoreError>;

    /// Hard delete; cascades to results, checkpoints, and usage records
    async fn delete(&self, task_id: Uuid) -> Result<bool, StoreError>;

    /// Pending tasks ordered by priority (1 first) then creation time
    async fn get_pending_tasks(&self, limit: u32) -> Result<Vec<Task>, StoreError>;

    /// Tasks currently leased by a worker
    async fn get_active_tasks_by_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<Task>, StoreError>;

    // =========================================================================
    // Checkpoint Operations
    // =========================================================================

    /// Persist a checkpoint and the task-row snapshot in one atomic step
    ///
    /// CAS on the task version: on success the task row carries the snapshot,
    /// `current_step`, and the bumped version, and a checkpoint row tagged
    /// with the new version exists: both or neither. Returns the new version,
    /// or `None` on contention.
    async fn save_checkpoint(
        &self,
        task_id: Uuid,
        step_name: &str,
        state: Value,
        expected_version: i64,
    ) -> Result<Option<i64>, StoreError>;

    /// Latest checkpoint for a task (the resumption point)
    async fn load_latest_checkpoint(
        &self,
        task_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// All checkpoints for a task, oldest first
    async fn list_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, StoreError>;

    // =========================================================================
    // Result Operations
    // =========================================================================

    /// Append a result row
    async fn add_result(&self, input: NewTaskResult) -> Result<TaskResult, StoreError>;

    /// All results for a task, oldest first
    async fn get_results(&self, task_id: Uuid) -> Result<Vec<TaskResult>, StoreError>;

    // =========================================================================
    // Token Usage Operations
    // =========================================================================

    /// Append a token-usage record
    async fn record_token_usage(&self, input: NewTokenUsage) -> Result<(), StoreError>;

    /// All usage records for a task
    async fn get_token_usage(&self, task_id: Uuid)
        -> Result<Vec<TokenUsageRecord>, StoreError>;

    // =========================================================================
    // Quality Check Operations
    // =========================================================================

    /// Append a quality-check record
    async fn record_quality_check(&self, input: NewQualityCheck) -> Result<(), StoreError>;

    /// All quality-check records for a task, oldest first
    async fn get_quality_checks(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<QualityCheckRecord>, StoreError>;
}
