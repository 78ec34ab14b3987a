//! In-memory implementation of TaskStore
//!
//! Primarily for tests and the embedded backend, with the same semantics as
//! the PostgreSQL implementation. A single write lock over the whole state
//! makes every mutation trivially linearizable.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::*;
use crate::store::{NewQualityCheck, NewTokenUsage, StoreError, TaskStore};

/// The full store contents; serializable so the embedded backend can persist
/// snapshots of it
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct StoreState {
    pub tasks: HashMap<Uuid, Task>,
    pub results: HashMap<Uuid, Vec<TaskResult>>,
    pub checkpoints: HashMap<Uuid, Vec<Checkpoint>>,
    pub usage: HashMap<Uuid, Vec<TokenUsageRecord>>,
    #[serde(default)]
    pub quality_checks: HashMap<Uuid, Vec<QualityCheckRecord>>,
}

impl StoreState {
    /// Find the live task mapped to an idempotency key
    fn live_task_for_key(&self, key: &str) -> Option<&Task> {
        self.tasks.values().find(|t| {
            t.idempotency_key.as_deref() == Some(key)
                && !t.status.is_terminal()
                && t.deleted_at.is_none()
        })
    }

    fn visible(&self, task_id: Uuid) -> Option<&Task> {
        self.tasks
            .get(&task_id)
            .filter(|t| t.deleted_at.is_none())
    }

    fn visible_mut(&mut self, task_id: Uuid) -> Option<&mut Task> {
        self.tasks
            .get_mut(&task_id)
            .filter(|t| t.deleted_at.is_none())
    }

    fn matches(task: &Task, filter: &TaskFilter) -> bool {
        if task.deleted_at.is_some() {
            return false;
        }
        if let Some(status) = filter.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(wt) = &filter.workflow_type {
            if &task.workflow_type != wt {
                return false;
            }
        }
        if let Some(uid) = &filter.user_id {
            if task.user_id.as_ref() != Some(uid) {
                return false;
            }
        }
        true
    }
}

/// In-memory implementation of TaskStore
pub struct InMemoryTaskStore {
    state: RwLock<StoreState>,
}

impl InMemoryTaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Number of tasks, including terminal ones
    pub fn task_count(&self) -> usize {
        self.state.read().tasks.len()
    }

    /// Drop everything (testing)
    pub fn clear(&self) {
        *self.state.write() = StoreState::default();
    }

    pub(crate) fn export(&self) -> StoreState {
        self.state.read().clone()
    }

    pub(crate) fn import(&self, state: StoreState) {
        *self.state.write() = state;
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, input: NewTask) -> Result<CreatedTask, StoreError> {
        let mut state = self.state.write();

        if let Some(key) = &input.idempotency_key {
            if let Some(existing) = state.live_task_for_key(key) {
                return Ok(CreatedTask {
                    task: existing.clone(),
                    created: false,
                });
            }
        }

        let task = Task {
            id: input.id.unwrap_or_else(Uuid::now_v7),
            user_id: input.user_id,
            workflow_type: input.workflow_type,
            mode: input.mode,
            priority: input.priority.clamp(1, 10),
            status: TaskStatus::Pending,
            current_step: None,
            retry_count: 0,
            text_retry_count: 0,
            image_retry_count: 0,
            error_message: None,
            idempotency_key: input.idempotency_key,
            params: input.params,
            worker_id: None,
            state_snapshot: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            deleted_at: None,
            version: 1,
        };

        state.tasks.insert(task.id, task.clone());
        Ok(CreatedTask {
            task,
            created: true,
        })
    }

    async fn find_by_id(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.state.read().visible(task_id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.state.read().live_task_for_key(key).cloned())
    }

    async fn find_by_user(
        &self,
        user_id: &str,
        page: Pagination,
    ) -> Result<Vec<Task>, StoreError> {
        self.find_many(
            TaskFilter {
                user_id: Some(user_id.to_string()),
                ..Default::default()
            },
            page,
        )
        .await
    }

    async fn find_many(
        &self,
        filter: TaskFilter,
        page: Pagination,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| StoreState::matches(t, &filter))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn count(&self, filter: TaskFilter) -> Result<u64, StoreError> {
        let state = self.state.read();
        Ok(state
            .tasks
            .values()
            .filter(|t| StoreState::matches(t, &filter))
            .count() as u64)
    }

    async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let task = match state.visible_mut(task_id) {
            Some(t) => t,
            None => return Ok(false),
        };
        if task.version != expected_version || !task.status.can_transition_to(status) {
            return Ok(false);
        }

        task.status = status;
        if status.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        if status != TaskStatus::Running {
            task.worker_id = None;
        }
        task.version += 1;
        Ok(true)
    }

    async fn update_current_step(
        &self,
        task_id: Uuid,
        step: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let task = match state.visible_mut(task_id) {
            Some(t) => t,
            None => return Ok(false),
        };
        if task.version != expected_version {
            return Ok(false);
        }
        task.current_step = Some(step.to_string());
        task.version += 1;
        Ok(true)
    }

    async fn increment_retry_count(
        &self,
        task_id: Uuid,
        kind: RetryKind,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let task = match state.visible_mut(task_id) {
            Some(t) => t,
            None => return Ok(false),
        };
        if task.version != expected_version {
            return Ok(false);
        }
        match kind {
            RetryKind::Graph => task.retry_count += 1,
            RetryKind::Text => task.text_retry_count += 1,
            RetryKind::Image => task.image_retry_count += 1,
        }
        task.version += 1;
        Ok(true)
    }

    async fn save_state_snapshot(
        &self,
        task_id: Uuid,
        snapshot: Value,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let task = match state.visible_mut(task_id) {
            Some(t) => t,
            None => return Ok(false),
        };
        if task.version != expected_version {
            return Ok(false);
        }
        task.state_snapshot = Some(snapshot);
        task.version += 1;
        Ok(true)
    }

    async fn claim_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let task = match state.visible_mut(task_id) {
            Some(t) => t,
            None => return Ok(false),
        };
        let claimable = matches!(task.status, TaskStatus::Pending | TaskStatus::Waiting)
            || (task.status == TaskStatus::Running && task.worker_id.is_none());
        if task.version != expected_version || !claimable {
            return Ok(false);
        }

        task.status = TaskStatus::Running;
        task.worker_id = Some(worker_id.to_string());
        if task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        task.version += 1;
        Ok(true)
    }

    async fn release_worker(
        &self,
        task_id: Uuid,
        worker_id: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let task = match state.visible_mut(task_id) {
            Some(t) => t,
            None => return Ok(false),
        };
        if task.version != expected_version || task.worker_id.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        task.worker_id = None;
        task.version += 1;
        Ok(true)
    }

    async fn mark_as_completed(
        &self,
        task_id: Uuid,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        self.update_status(task_id, TaskStatus::Completed, expected_version)
            .await
    }

    async fn mark_as_failed(
        &self,
        task_id: Uuid,
        error_message: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let task = match state.visible_mut(task_id) {
            Some(t) => t,
            None => return Ok(false),
        };
        if task.version != expected_version || task.status.is_terminal() {
            return Ok(false);
        }

        task.status = TaskStatus::Failed;
        task.error_message = Some(error_message.to_string());
        task.completed_at = Some(Utc::now());
        task.worker_id = None;
        task.version += 1;
        Ok(true)
    }

    async fn soft_delete(
        &self,
        task_id: Uuid,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let task = match state.visible_mut(task_id) {
            Some(t) => t,
            None => return Ok(false),
        };
        if task.version != expected_version {
            return Ok(false);
        }
        task.deleted_at = Some(Utc::now());
        task.version += 1;
        Ok(true)
    }

    async fn delete(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let existed = state.tasks.remove(&task_id).is_some();
        state.results.remove(&task_id);
        state.checkpoints.remove(&task_id);
        state.usage.remove(&task_id);
        state.quality_checks.remove(&task_id);
        Ok(existed)
    }

    async fn get_pending_tasks(&self, limit: u32) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.deleted_at.is_none())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        tasks.truncate(limit as usize);
        Ok(tasks)
    }

    async fn get_active_tasks_by_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read();
        Ok(state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running && t.worker_id.as_deref() == Some(worker_id)
            })
            .cloned()
            .collect())
    }

    async fn save_checkpoint(
        &self,
        task_id: Uuid,
        step_name: &str,
        checkpoint_state: Value,
        expected_version: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut state = self.state.write();
        let task = match state.visible_mut(task_id) {
            Some(t) => t,
            None => return Ok(None),
        };
        if task.version != expected_version {
            return Ok(None);
        }

        task.state_snapshot = Some(checkpoint_state.clone());
        task.current_step = Some(step_name.to_string());
        // Subsystem retry counters are mutated only inside the state; mirror
        // them onto the row so they are queryable without the snapshot.
        if let Some(n) = checkpoint_state
            .get("text_retry_count")
            .and_then(|v| v.as_i64())
        {
            task.text_retry_count = n as i32;
        }
        if let Some(n) = checkpoint_state
            .get("image_retry_count")
            .and_then(|v| v.as_i64())
        {
            task.image_retry_count = n as i32;
        }
        task.version += 1;
        let new_version = task.version;

        state.checkpoints.entry(task_id).or_default().push(Checkpoint {
            task_id,
            step_name: step_name.to_string(),
            state: checkpoint_state,
            version: new_version,
            created_at: Utc::now(),
        });

        Ok(Some(new_version))
    }

    async fn load_latest_checkpoint(
        &self,
        task_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let state = self.state.read();
        Ok(state
            .checkpoints
            .get(&task_id)
            .and_then(|cps| cps.last().cloned()))
    }

    async fn list_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let state = self.state.read();
        Ok(state.checkpoints.get(&task_id).cloned().unwrap_or_default())
    }

    async fn add_result(&self, input: NewTaskResult) -> Result<TaskResult, StoreError> {
        let result = TaskResult {
            id: Uuid::now_v7(),
            task_id: input.task_id,
            result_type: input.result_type,
            content: input.content,
            file_path: input.file_path,
            metadata: input.metadata,
            created_at: Utc::now(),
        };
        self.state
            .write()
            .results
            .entry(input.task_id)
            .or_default()
            .push(result.clone());
        Ok(result)
    }

    async fn get_results(&self, task_id: Uuid) -> Result<Vec<TaskResult>, StoreError> {
        Ok(self
            .state
            .read()
            .results
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_token_usage(&self, input: NewTokenUsage) -> Result<(), StoreError> {
        let record = TokenUsageRecord {
            id: Uuid::now_v7(),
            task_id: input.task_id,
            step_name: input.step_name,
            input_tokens: input.input_tokens,
            output_tokens: input.output_tokens,
            cost: input.cost,
            created_at: Utc::now(),
        };
        self.state
            .write()
            .usage
            .entry(record.task_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn get_token_usage(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<TokenUsageRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .usage
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_quality_check(&self, input: NewQualityCheck) -> Result<(), StoreError> {
        let record = QualityCheckRecord {
            id: Uuid::now_v7(),
            task_id: input.task_id,
            step_name: input.step_name,
            passed: input.passed,
            score: input.score,
            report: input.report,
            created_at: Utc::now(),
        };
        self.state
            .write()
            .quality_checks
            .entry(record.task_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn get_quality_checks(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<QualityCheckRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .quality_checks
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }
}
