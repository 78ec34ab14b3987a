//! Durable job queue
//!
//! Priority-aware queue with leases: jobs are delivered at-least-once, a
//! leased job that is neither acked nor nacked before its lease expires is
//! redelivered, and failures back off exponentially until the attempt budget
//! is spent. Lower priority numbers go first; FIFO within a priority.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::RetryPolicy;
use crate::webhook::CallbackOptions;

pub use memory::InMemoryJobQueue;
pub use postgres::PostgresJobQueue;

/// Errors from queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue has been closed
    #[error("queue is closed")]
    Closed,

    /// No durable queue backend is configured
    #[error("no queue backend available: {0}")]
    Unavailable(String),

    /// Backend failure
    #[error("queue backend error: {0}")]
    Backend(String),

    /// Payload could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One unit of queued work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub task_id: Uuid,
    pub workflow_type: String,
    pub params: serde_json::Value,
    /// 1 is highest, 10 lowest
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    /// Number of deliveries so far
    pub attempt_count: u32,
    /// Callback the worker fires on terminal transitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackOptions>,
}

impl Job {
    pub fn new(task_id: Uuid, workflow_type: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            task_id,
            workflow_type: workflow_type.into(),
            params,
            priority: 5,
            created_at: Utc::now(),
            attempt_count: 0,
            callback: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn with_callback(mut self, callback: CallbackOptions) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// Options for enqueueing
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Override the job's priority
    pub priority: Option<u8>,
    /// Keep the job invisible for this long
    pub delay: Option<Duration>,
}

/// A job currently held under lease
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: Job,
    pub lease_id: Uuid,
    pub worker_id: String,
}

/// What happened to a nacked job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Redelivery scheduled
    WillRetry { attempt: u32, delay: Duration },
    /// Attempt budget spent; the job moved to the failed tombstone set
    Discarded,
}

/// Queue depth counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub delayed: usize,
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a lease lasts before the job is considered abandoned
    pub lease_timeout: Duration,

    /// Redelivery backoff
    pub retry: RetryPolicy,

    /// Completed tombstones kept before pruning
    pub retention_completed: usize,

    /// Failed tombstones kept before pruning
    pub retention_failed: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(60),
            retry: RetryPolicy::exponential(),
            retention_completed: 1000,
            retention_failed: 5000,
        }
    }
}

/// A durable, priority-aware job queue with leases
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Add a job; fails loudly when the queue is closed or unavailable
    async fn enqueue(&self, job: Job, options: EnqueueOptions) -> Result<(), QueueError>;

    /// Take the next job under lease, blocking until one is available
    ///
    /// Returns `None` once the queue is closed.
    async fn lease(&self, worker_id: &str) -> Result<Option<LeasedJob>, QueueError>;

    /// Settle a lease successfully
    async fn ack(&self, leased: &LeasedJob) -> Result<(), QueueError>;

    /// Fail a lease; the queue retries with backoff or discards
    async fn nack(&self, leased: &LeasedJob, reason: &str) -> Result<NackOutcome, QueueError>;

    /// Remove a waiting or delayed job (task cancellation); false when the
    /// job is already leased or gone
    async fn remove(&self, task_id: Uuid) -> Result<bool, QueueError>;

    /// Current depth counters
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Stop handing out jobs (leases in flight are unaffected)
    async fn pause(&self);

    /// Resume handing out jobs
    async fn resume(&self);

    /// Wait until nothing is waiting, delayed, or leased
    async fn drain(&self) -> Result<(), QueueError>;

    /// Close the queue; blocked `lease` calls return `None`
    async fn close(&self);
}
