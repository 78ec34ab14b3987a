//! Embedded file-backed implementation of TaskStore
//!
//! Development-scale persistence: the in-memory store's full contents are
//! written to a JSON file after every mutation (write to a temp file, then
//! rename, so a crash never leaves a torn snapshot). Reads are served from
//! memory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::memory::InMemoryTaskStore;
use crate::models::*;
use crate::store::{NewQualityCheck, NewTokenUsage, StoreError, TaskStore};

/// Embedded JSON-file implementation of TaskStore
pub struct EmbeddedTaskStore {
    inner: InMemoryTaskStore,
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl EmbeddedTaskStore {
    /// Open (or create) a store at the given path
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let inner = InMemoryTaskStore::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                inner.import(state);
                debug!(path = %path.display(), "loaded embedded store");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "starting empty embedded store");
            }
            Err(e) => return Err(StoreError::Io(e.to_string())),
        }

        Ok(Self {
            inner,
            path,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let state = self.inner.export();
        let bytes = serde_json::to_vec_pretty(&state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    /// Persist after a mutation; the in-memory write already happened, so a
    /// flush failure is logged and surfaced but leaves reads consistent.
    async fn flush_after<T>(&self, outcome: T) -> Result<T, StoreError> {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "embedded store flush failed");
            return Err(e);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl TaskStore for EmbeddedTaskStore {
    async fn create_task(&self, input: NewTask) -> Result<CreatedTask, StoreError> {
        let created = self.inner.create_task(input).await?;
        self.flush_after(created).await
    }

    async fn find_by_id(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        self.inner.find_by_id(task_id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>, StoreError> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn find_by_user(
        &self,
        user_id: &str,
        page: Pagination,
    ) -> Result<Vec<Task>, StoreError> {
        self.inner.find_by_user(user_id, page).await
    }

    async fn find_many(
        &self,
        filter: TaskFilter,
        page: Pagination,
    ) -> Result<Vec<Task>, StoreError> {
        self.inner.find_many(filter, page).await
    }

    async fn count(&self, filter: TaskFilter) -> Result<u64, StoreError> {
        self.inner.count(filter).await
    }

    async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let ok = self
            .inner
            .update_status(task_id, status, expected_version)
            .await?;
        if ok {
            return self.flush_after(ok).await;
        }
        Ok(ok)
    }

    async fn update_current_step(
        &self,
        task_id: Uuid,
        step: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let ok = self
            .inner
            .update_current_step(task_id, step, expected_version)
            .await?;
        if ok {
            return self.flush_after(ok).await;
        }
        Ok(ok)
    }

    async fn increment_retry_count(
        &self,
        task_id: Uuid,
        kind: RetryKind,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let ok = self
            .inner
            .increment_retry_count(task_id, kind, expected_version)
            .await?;
        if ok {
            return self.flush_after(ok).await;
        }
        Ok(ok)
    }

    async fn save_state_snapshot(
        &self,
        task_id: Uuid,
        snapshot: Value,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let ok = self
            .inner
            .save_state_snapshot(task_id, snapshot, expected_version)
            .await?;
        if ok {
            return self.flush_after(ok).await;
        }
        Ok(ok)
    }

    async fn claim_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let ok = self
            .inner
            .claim_task(task_id, worker_id, expected_version)
            .await?;
        if ok {
            return self.flush_after(ok).await;
        }
        Ok(ok)
    }

    async fn release_worker(
        &self,
        task_id: Uuid,
        worker_id: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let ok = self
            .inner
            .release_worker(task_id, worker_id, expected_version)
            .await?;
        if ok {
            return self.flush_after(ok).await;
        }
        Ok(ok)
    }

    async fn mark_as_completed(
        &self,
        task_id: Uuid,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let ok = self.inner.mark_as_completed(task_id, expected_version).await?;
        if ok {
            return self.flush_after(ok).await;
        }
        Ok(ok)
    }

    async fn mark_as_failed(
        &self,
        task_id: Uuid,
        error_message: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let ok = self
            .inner
            .mark_as_failed(task_id, error_message, expected_version)
            .await?;
        if ok {
            return self.flush_after(ok).await;
        }
        Ok(ok)
    }

    async fn soft_delete(
        &self,
        task_id: Uuid,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let ok = self.inner.soft_delete(task_id, expected_version).await?;
        if ok {
            return self.flush_after(ok).await;
        }
        Ok(ok)
    }

    async fn delete(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let ok = self.inner.delete(task_id).await?;
        if ok {
            return self.flush_after(ok).await;
        }
        Ok(ok)
    }

    async fn get_pending_tasks(&self, limit: u32) -> Result<Vec<Task>, StoreError> {
        self.inner.get_pending_tasks(limit).await
    }

    async fn get_active_tasks_by_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<Task>, StoreError> {
        self.inner.get_active_tasks_by_worker(worker_id).await
    }

    async fn save_checkpoint(
        &self,
        task_id: Uuid,
        step_name: &str,
        state: Value,
        expected_version: i64,
    ) -> Result<Option<i64>, StoreError> {
        let outcome = self
            .inner
            .save_checkpoint(task_id, step_name, state, expected_version)
            .await?;
        if outcome.is_some() {
            return self.flush_after(outcome).await;
        }
        Ok(outcome)
    }

    async fn load_latest_checkpoint(
        &self,
        task_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError> {
        self.inner.load_latest_checkpoint(task_id).await
    }

    async fn list_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        self.inner.list_checkpoints(task_id).await
    }

    async fn add_result(&self, input: NewTaskResult) -> Result<TaskResult, StoreError> {
        let result = self.inner.add_result(input).await?;
        self.flush_after(result).await
    }

    async fn get_results(&self, task_id: Uuid) -> Result<Vec<TaskResult>, StoreError> {
        self.inner.get_results(task_id).await
    }

    async fn record_token_usage(&self, input: NewTokenUsage) -> Result<(), StoreError> {
        self.inner.record_token_usage(input).await?;
        self.flush_after(()).await
    }

    async fn get_token_usage(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<TokenUsageRecord>, StoreError> {
        self.inner.get_token_usage(task_id).await
    }

    async fn record_quality_check(&self, input: NewQualityCheck) -> Result<(), StoreError> {
        self.inner.record_quality_check(input).await?;
        self.flush_after(()).await
    }

    async fn get_quality_checks(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<QualityCheckRecord>, StoreError> {
        self.inner.get_quality_checks(task_id).await
    }
}
