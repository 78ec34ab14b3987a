//! # Inkforge Storage
//!
//! Durable persistence for tasks, results, checkpoints, and token usage
//! behind the [`TaskStore`] trait.
//!
//! - Every task row carries a monotonically increasing `version`; every
//!   mutation is compare-and-swap on it. The repository is the sole authority
//!   on versions.
//! - Precondition failures (version mismatch, wrong lease holder, invalid
//!   transition) are results, not errors.
//! - Idempotency keys collapse repeated submissions onto the single live
//!   task mapped to the key.
//!
//! Three backends: [`InMemoryTaskStore`] (tests), [`EmbeddedTaskStore`]
//! (JSON-file snapshots for development), [`PostgresTaskStore`] (production).

pub mod config;
pub mod file;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use config::{connect, DatabaseKind, StorageConfig};
pub use file::EmbeddedTaskStore;
pub use memory::InMemoryTaskStore;
pub use models::{
    Checkpoint, CreatedTask, NewTask, NewTaskResult, Pagination, QualityCheckRecord, RetryKind,
    Task, TaskFilter, TaskMode, TaskResult, TaskStatus, TokenUsageRecord,
};
pub use postgres::PostgresTaskStore;
pub use store::{NewQualityCheck, NewTokenUsage, StoreError, TaskStore};
