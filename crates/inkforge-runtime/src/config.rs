//! Runtime configuration
//!
//! Queue selection comes from `QUEUE_URL`: unset means no queue (sync mode
//! only), `memory` selects the single-process in-memory queue, and a
//! `postgres://` URL selects the durable PostgreSQL queue.

use std::sync::Arc;

use tracing::info;

use crate::queue::{InMemoryJobQueue, JobQueue, PostgresJobQueue, QueueConfig, QueueError};

/// Selected queue backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMode {
    /// No backend; async scheduling is rejected
    None,
    /// Single-process in-memory queue
    Memory,
    /// PostgreSQL-backed durable queue
    Postgres(String),
}

impl QueueMode {
    /// Read the queue selection from the environment
    pub fn from_env() -> Result<Self, QueueError> {
        match std::env::var("QUEUE_URL") {
            Err(_) => Ok(Self::None),
            Ok(v) if v.is_empty() => Ok(Self::None),
            Ok(v) if v == "memory" => Ok(Self::Memory),
            Ok(v) if v.starts_with("postgres://") || v.starts_with("postgresql://") => {
                Ok(Self::Postgres(v))
            }
            Ok(v) => Err(QueueError::Unavailable(format!(
                "unrecognized QUEUE_URL: {v}"
            ))),
        }
    }
}

/// Open the configured queue backend, if any
pub async fn connect_queue(
    mode: &QueueMode,
    config: QueueConfig,
) -> Result<Option<Arc<dyn JobQueue>>, QueueError> {
    match mode {
        QueueMode::None => {
            info!("no queue configured; sync mode only");
            Ok(None)
        }
        QueueMode::Memory => {
            info!("using in-memory job queue");
            Ok(Some(Arc::new(InMemoryJobQueue::new(config))))
        }
        QueueMode::Postgres(url) => {
            info!("using postgres job queue");
            Ok(Some(Arc::new(PostgresJobQueue::connect(url, config).await?)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_none_mode_yields_no_queue() {
        let queue = connect_queue(&QueueMode::None, QueueConfig::default())
            .await
            .unwrap();
        assert!(queue.is_none());
    }

    #[tokio::test]
    async fn test_memory_mode_yields_queue() {
        let queue = connect_queue(&QueueMode::Memory, QueueConfig::default())
            .await
            .unwrap();
        assert!(queue.is_some());
    }
}
