//! # Inkforge Runtime
//!
//! The execution substrate for durable content pipelines.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              SyncExecutor          Scheduler                 │
//! │  (in-process end-to-end)    (validate, persist, enqueue)     │
//! └─────────────────────────────────────────────────────────────┘
//!                  │                        │
//!                  ▼                        ▼
//! ┌──────────────────────────┐  ┌──────────────────────────────┐
//! │        GraphDriver       │  │      JobQueue + Worker        │
//! │ (steps, reducers,        │◀─│ (leases, claim CAS, backoff,  │
//! │  timeouts, checkpoints)  │  │  at-least-once redelivery)    │
//! └──────────────────────────┘  └──────────────────────────────┘
//!                  │
//!                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            TaskStore (versions, snapshots, results)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both execution paths drive the same [`GraphDriver`], so checkpointing,
//! cancellation, and retry semantics are identical whether a run happens
//! inline or on a leased worker.

pub mod cancel;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod progress;
pub mod queue;
pub mod recorder;
pub mod retry;
pub mod scheduler;
pub mod webhook;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::cancel::CancelHub;
    pub use crate::driver::{DriverConfig, GraphDriver, RunOutcome};
    pub use crate::error::{FailureKind, RunFailure};
    pub use crate::executor::{
        ExecuteRequest, ExecutionResult, ExecutionStatus, ExecutorError, SyncExecutor,
        SyncExecutorConfig,
    };
    pub use crate::progress::{ProgressBroker, ProgressEvent};
    pub use crate::queue::{
        EnqueueOptions, InMemoryJobQueue, Job, JobQueue, LeasedJob, NackOutcome,
        PostgresJobQueue, QueueConfig, QueueError, QueueStats,
    };
    pub use crate::retry::RetryPolicy;
    pub use crate::scheduler::{ScheduleRequest, Scheduler, SchedulerError};
    pub use crate::webhook::{
        CallbackOptions, WebhookDispatcher, WebhookDispatcherConfig, WebhookEvent,
        WebhookEventKind,
    };
    pub use crate::worker::{Worker, WorkerConfig};
}

// Re-export key types at crate root
pub use cancel::CancelHub;
pub use config::{connect_queue, QueueMode};
pub use driver::{DriverConfig, GraphDriver, RunOutcome};
pub use error::{FailureKind, RunFailure};
pub use executor::{
    ExecuteRequest, ExecutionResult, ExecutionStatus, ExecutorError, SyncExecutor,
    SyncExecutorConfig,
};
pub use progress::{ProgressBroker, ProgressCallback, ProgressEvent};
pub use queue::{
    EnqueueOptions, InMemoryJobQueue, Job, JobQueue, LeasedJob, NackOutcome, PostgresJobQueue,
    QueueConfig, QueueError, QueueStats,
};
pub use recorder::StoreRecorder;
pub use retry::RetryPolicy;
pub use scheduler::{ScheduleRequest, Scheduler, SchedulerError};
pub use webhook::{
    CallbackOptions, WebhookDispatcher, WebhookDispatcherConfig, WebhookEvent, WebhookEventKind,
};
pub use worker::{Worker, WorkerConfig};
