//! Persistent data model
//!
//! Tasks are the unit of work; results, checkpoints, and token-usage records
//! hang off them and are removed when the task is deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet queued or claimed
    Pending,

    /// Queued but not yet leased by a worker
    Waiting,

    /// A worker (or the sync executor) is advancing the task
    Running,

    /// Finished successfully
    Completed,

    /// Finished with an error
    Failed,

    /// Cancelled before completion
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Validate a state transition
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Waiting) => true,
            (Pending, Running) => true,
            (Pending, Cancelled) => true,
            (Pending, Failed) => true,
            (Waiting, Running) => true,
            (Waiting, Cancelled) => true,
            (Waiting, Failed) => true,
            (Running, Completed) => true,
            (Running, Failed) => true,
            (Running, Cancelled) => true,
            // Queue-level retry puts a released task back in line
            (Running, Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Execution mode requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Sync,
    Async,
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
        }
    }
}

impl std::str::FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => Err(format!("unknown task mode: {other}")),
        }
    }
}

/// Which retry counter to bump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Graph-level retries (queue redelivery, node retries surfaced upward)
    Graph,
    /// Quality-gate retries of the text producer
    Text,
    /// Image generation retries
    Image,
}

/// A durable task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub workflow_type: String,
    pub mode: TaskMode,
    /// 1 is highest, 10 lowest
    pub priority: u8,
    pub status: TaskStatus,
    pub current_step: Option<String>,
    pub retry_count: i32,
    pub text_retry_count: i32,
    pub image_retry_count: i32,
    pub error_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub params: Value,
    /// Lease holder; non-null only while running
    pub worker_id: Option<String>,
    /// Latest state snapshot (opaque JSON)
    pub state_snapshot: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Strictly increasing; every mutation is CAS on this value
    pub version: i64,
}

/// Input for creating a task
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Caller-supplied id; generated when absent
    pub id: Option<Uuid>,
    pub user_id: Option<String>,
    pub workflow_type: String,
    pub mode: TaskMode,
    pub priority: u8,
    pub params: Value,
    pub idempotency_key: Option<String>,
}

impl NewTask {
    pub fn new(workflow_type: impl Into<String>, mode: TaskMode, params: Value) -> Self {
        Self {
            id: None,
            user_id: None,
            workflow_type: workflow_type.into(),
            mode,
            priority: 5,
            params,
            idempotency_key: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Outcome of a create call
#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub task: Task,
    /// False when an idempotency key matched an existing live task
    pub created: bool,
}

/// One produced artifact (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub result_type: String,
    pub content: Option<String>,
    pub file_path: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Input for appending a result row
#[derive(Debug, Clone)]
pub struct NewTaskResult {
    pub task_id: Uuid,
    pub result_type: String,
    pub content: Option<String>,
    pub file_path: Option<String>,
    pub metadata: Option<Value>,
}

/// Per-(task, step) token accounting (append-only, never on the control path)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub step_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

/// A recorded quality verdict (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheckRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub step_name: String,
    pub passed: bool,
    pub score: f64,
    /// The full combined report as JSON
    pub report: Value,
    pub created_at: DateTime<Utc>,
}

/// A durable state snapshot (append-only per task)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: Uuid,
    pub step_name: String,
    pub state: Value,
    /// The task version produced by the write that took this checkpoint
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Filter for listing tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub workflow_type: Option<String>,
    pub user_id: Option<String>,
}

/// Pagination parameters
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}
