//! PostgreSQL implementation of TaskStore
//!
//! Production persistence with:
//! - Optimistic concurrency via a version column on every task row
//! - Status-transition guards expressed in the WHERE clause so a CAS is one
//!   round trip
//! - Checkpoint writes transactionally coupled to the task-row update

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::models::*;
use crate::store::{NewQualityCheck, NewTokenUsage, StoreError, TaskStore};

/// Schema bootstrap, executed at connect time
const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id UUID PRIMARY KEY,
    user_id TEXT,
    workflow_type TEXT NOT NULL,
    mode TEXT NOT NULL,
    priority INT NOT NULL DEFAULT 5,
    status TEXT NOT NULL DEFAULT 'pending',
    current_step TEXT,
    retry_count INT NOT NULL DEFAULT 0,
    text_retry_count INT NOT NULL DEFAULT 0,
    image_retry_count INT NOT NULL DEFAULT 0,
    error_message TEXT,
    idempotency_key TEXT,
    params JSONB NOT NULL DEFAULT '{}'::jsonb,
    worker_id TEXT,
    state_snapshot JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    deleted_at TIMESTAMPTZ,
    version BIGINT NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_tasks_idempotency
    ON tasks (idempotency_key) WHERE idempotency_key IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_tasks_status_priority
    ON tasks (status, priority, created_at);

CREATE INDEX IF NOT EXISTS idx_tasks_worker
    ON tasks (worker_id) WHERE worker_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS task_results (
    id UUID PRIMARY KEY,
    task_id UUID NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    result_type TEXT NOT NULL,
    content TEXT,
    file_path TEXT,
    metadata JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_task_results_task ON task_results (task_id, created_at);

CREATE TABLE IF NOT EXISTS task_checkpoints (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    task_id UUID NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    step_name TEXT NOT NULL,
    state JSONB NOT NULL,
    version BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_task_checkpoints_task ON task_checkpoints (task_id, version);

CREATE TABLE IF NOT EXISTS quality_checks (
    id UUID PRIMARY KEY,
    task_id UUID NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    step_name TEXT NOT NULL,
    passed BOOLEAN NOT NULL,
    score DOUBLE PRECISION NOT NULL,
    report JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_quality_checks_task ON quality_checks (task_id, created_at);

CREATE TABLE IF NOT EXISTS token_usage (
    id UUID PRIMARY KEY,
    task_id UUID NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    step_name TEXT NOT NULL,
    input_tokens BIGINT NOT NULL DEFAULT 0,
    output_tokens BIGINT NOT NULL DEFAULT 0,
    cost DOUBLE PRECISION NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_token_usage_task ON token_usage (task_id);
"#;

const NON_TERMINAL: [&str; 3] = ["pending", "waiting", "running"];

/// PostgreSQL implementation of TaskStore
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Wrap an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bootstrap the schema
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Run the embedded schema bootstrap
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("migration failed: {}", e);
                    StoreError::Database(e.to_string())
                })?;
        }
        debug!("storage schema ready");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Statuses a task may be in before transitioning to `target`
    fn allowed_from(target: TaskStatus) -> Vec<String> {
        [
            TaskStatus::Pending,
            TaskStatus::Waiting,
            TaskStatus::Running,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(target))
        .map(|s| s.to_string())
        .collect()
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let status: String = row.get("status");
    let mode: String = row.get("mode");
    let priority: i32 = row.get("priority");

    Ok(Task {
        id: row.get("id"),
        user_id: row.get("user_id"),
        workflow_type: row.get("workflow_type"),
        mode: mode
            .parse()
            .map_err(|e: String| StoreError::Serialization(e))?,
        priority: priority.clamp(1, 10) as u8,
        status: status
            .parse()
            .map_err(|e: String| StoreError::Serialization(e))?,
        current_step: row.get("current_step"),
        retry_count: row.get("retry_count"),
        text_retry_count: row.get("text_retry_count"),
        image_retry_count: row.get("image_retry_count"),
        error_message: row.get("error_message"),
        idempotency_key: row.get("idempotency_key"),
        params: row.get("params"),
        worker_id: row.get("worker_id"),
        state_snapshot: row.get("state_snapshot"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        deleted_at: row.get("deleted_at"),
        version: row.get("version"),
    })
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

const TASK_COLUMNS: &str = "id, user_id, workflow_type, mode, priority, status, current_step, \
     retry_count, text_retry_count, image_retry_count, error_message, idempotency_key, params, \
     worker_id, state_snapshot, created_at, started_at, completed_at, deleted_at, version";

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, input), fields(workflow_type = %input.workflow_type))]
    async fn create_task(&self, input: NewTask) -> Result<CreatedTask, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(key) = &input.idempotency_key {
            let existing = sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE idempotency_key = $1 AND status = ANY($2) AND deleted_at IS NULL \
                 LIMIT 1 FOR UPDATE"
            ))
            .bind(key)
            .bind(NON_TERMINAL.map(String::from).to_vec())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            if let Some(row) = existing {
                return Ok(CreatedTask {
                    task: task_from_row(&row)?,
                    created: false,
                });
            }
        }

        let id = input.id.unwrap_or_else(Uuid::now_v7);
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO tasks (id, user_id, workflow_type, mode, priority, status,
                               idempotency_key, params, created_at, version)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, 1)
            "#,
        )
        .bind(id)
        .bind(&input.user_id)
        .bind(&input.workflow_type)
        .bind(input.mode.to_string())
        .bind(i32::from(input.priority.clamp(1, 10)))
        .bind(&input.idempotency_key)
        .bind(&input.params)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        let task = Task {
            id,
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
            created_at: now,
            started_at: None,
            completed_at: None,
            deleted_at: None,
            version: 1,
        };

        debug!(task_id = %id, "created task");
        Ok(CreatedTask {
            task,
            created: true,
        })
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE idempotency_key = $1 AND status = ANY($2) AND deleted_at IS NULL LIMIT 1"
        ))
        .bind(key)
        .bind(NON_TERMINAL.map(String::from).to_vec())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(task_from_row).transpose()
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
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE deleted_at IS NULL");
        let mut idx = 0;
        if filter.status.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND status = ${idx}"));
        }
        if filter.workflow_type.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND workflow_type = ${idx}"));
        }
        if filter.user_id.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND user_id = ${idx}"));
        }
        sql.push_str(&format!(
            " ORDER BY created_at DESC OFFSET ${} LIMIT ${}",
            idx + 1,
            idx + 2
        ));

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.to_string());
        }
        if let Some(wt) = &filter.workflow_type {
            query = query.bind(wt.clone());
        }
        if let Some(uid) = &filter.user_id {
            query = query.bind(uid.clone());
        }
        query = query.bind(i64::from(page.offset)).bind(i64::from(page.limit));

        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn count(&self, filter: TaskFilter) -> Result<u64, StoreError> {
        let mut sql = "SELECT COUNT(*) AS n FROM tasks WHERE deleted_at IS NULL".to_string();
        let mut idx = 0;
        if filter.status.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND status = ${idx}"));
        }
        if filter.workflow_type.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND workflow_type = ${idx}"));
        }
        if filter.user_id.is_some() {
            idx += 1;
            sql.push_str(&format!(" AND user_id = ${idx}"));
        }
        let _ = idx;

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.to_string());
        }
        if let Some(wt) = &filter.workflow_type {
            query = query.bind(wt.clone());
        }
        if let Some(uid) = &filter.user_id {
            query = query.bind(uid.clone());
        }

        let row = query.fetch_one(&self.pool).await.map_err(db_err)?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    #[instrument(skip(self))]
    async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = $3,
                version = version + 1,
                completed_at = CASE WHEN $4 THEN now() ELSE completed_at END,
                worker_id = CASE WHEN $3 = 'running' THEN worker_id ELSE NULL END
            WHERE id = $1 AND version = $2 AND deleted_at IS NULL AND status = ANY($5)
            "#,
        )
        .bind(task_id)
        .bind(expected_version)
        .bind(status.to_string())
        .bind(status.is_terminal())
        .bind(Self::allowed_from(status))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_current_step(
        &self,
        task_id: Uuid,
        step: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET current_step = $3, version = version + 1 \
             WHERE id = $1 AND version = $2 AND deleted_at IS NULL",
        )
        .bind(task_id)
        .bind(expected_version)
        .bind(step)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn increment_retry_count(
        &self,
        task_id: Uuid,
        kind: RetryKind,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let column = match kind {
            RetryKind::Graph => "retry_count",
            RetryKind::Text => "text_retry_count",
            RetryKind::Image => "image_retry_count",
        };
        let result = sqlx::query(&format!(
            "UPDATE tasks SET {column} = {column} + 1, version = version + 1 \
             WHERE id = $1 AND version = $2 AND deleted_at IS NULL"
        ))
        .bind(task_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_state_snapshot(
        &self,
        task_id: Uuid,
        snapshot: Value,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET state_snapshot = $3, version = version + 1 \
             WHERE id = $1 AND version = $2 AND deleted_at IS NULL",
        )
        .bind(task_id)
        .bind(expected_version)
        .bind(&snapshot)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn claim_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = 'running',
                worker_id = $3,
                started_at = COALESCE(started_at, now()),
                version = version + 1
            WHERE id = $1 AND version = $2 AND deleted_at IS NULL
              AND (status IN ('pending', 'waiting')
                   OR (status = 'running' AND worker_id IS NULL))
            "#,
        )
        .bind(task_id)
        .bind(expected_version)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_worker(
        &self,
        task_id: Uuid,
        worker_id: &str,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET worker_id = NULL, version = version + 1 \
             WHERE id = $1 AND version = $2 AND worker_id = $3 AND deleted_at IS NULL",
        )
        .bind(task_id)
        .bind(expected_version)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
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
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = 'failed',
                error_message = $3,
                completed_at = now(),
                worker_id = NULL,
                version = version + 1
            WHERE id = $1 AND version = $2 AND deleted_at IS NULL
              AND status IN ('pending', 'waiting', 'running')
            "#,
        )
        .bind(task_id)
        .bind(expected_version)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn soft_delete(
        &self,
        task_id: Uuid,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET deleted_at = now(), version = version + 1 \
             WHERE id = $1 AND version = $2 AND deleted_at IS NULL",
        )
        .bind(task_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, task_id: Uuid) -> Result<bool, StoreError> {
        // Results, checkpoints, and usage cascade via foreign keys
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_pending_tasks(&self, limit: u32) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = 'pending' AND deleted_at IS NULL \
             ORDER BY priority ASC, created_at ASC LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(task_from_row).collect()
    }

    async fn get_active_tasks_by_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = 'running' AND worker_id = $1 AND deleted_at IS NULL"
        ))
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self, state))]
    async fn save_checkpoint(
        &self,
        task_id: Uuid,
        step_name: &str,
        state: Value,
        expected_version: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Subsystem retry counters are mirrored out of the snapshot so the
        // row stays queryable without deserializing it
        let row = sqlx::query(
            r#"
            UPDATE tasks SET
                state_snapshot = $3,
                current_step = $4,
                text_retry_count = COALESCE(($3->>'text_retry_count')::int, text_retry_count),
                image_retry_count = COALESCE(($3->>'image_retry_count')::int, image_retry_count),
                version = version + 1
            WHERE id = $1 AND version = $2 AND deleted_at IS NULL
            RETURNING version
            "#,
        )
        .bind(task_id)
        .bind(expected_version)
        .bind(&state)
        .bind(step_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let new_version: i64 = match row {
            Some(row) => row.get("version"),
            // Contended: roll back so neither write lands
            None => return Ok(None),
        };

        sqlx::query(
            "INSERT INTO task_checkpoints (task_id, step_name, state, version) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(task_id)
        .bind(step_name)
        .bind(&state)
        .bind(new_version)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(new_version))
    }

    async fn load_latest_checkpoint(
        &self,
        task_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            "SELECT task_id, step_name, state, version, created_at FROM task_checkpoints \
             WHERE task_id = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| Checkpoint {
            task_id: row.get("task_id"),
            step_name: row.get("step_name"),
            state: row.get("state"),
            version: row.get("version"),
            created_at: row.get("created_at"),
        }))
    }

    async fn list_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT task_id, step_name, state, version, created_at FROM task_checkpoints \
             WHERE task_id = $1 ORDER BY version ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| Checkpoint {
                task_id: row.get("task_id"),
                step_name: row.get("step_name"),
                state: row.get("state"),
                version: row.get("version"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn add_result(&self, input: NewTaskResult) -> Result<TaskResult, StoreError> {
        let id = Uuid::now_v7();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO task_results (id, task_id, result_type, content, file_path, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(input.task_id)
        .bind(&input.result_type)
        .bind(&input.content)
        .bind(&input.file_path)
        .bind(&input.metadata)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(TaskResult {
            id,
            task_id: input.task_id,
            result_type: input.result_type,
            content: input.content,
            file_path: input.file_path,
            metadata: input.metadata,
            created_at: now,
        })
    }

    async fn get_results(&self, task_id: Uuid) -> Result<Vec<TaskResult>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, task_id, result_type, content, file_path, metadata, created_at \
             FROM task_results WHERE task_id = $1 ORDER BY created_at ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| TaskResult {
                id: row.get("id"),
                task_id: row.get("task_id"),
                result_type: row.get("result_type"),
                content: row.get("content"),
                file_path: row.get("file_path"),
                metadata: row.get("metadata"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn record_token_usage(&self, input: NewTokenUsage) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO token_usage (id, task_id, step_name, input_tokens, output_tokens, cost) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::now_v7())
        .bind(input.task_id)
        .bind(&input.step_name)
        .bind(input.input_tokens)
        .bind(input.output_tokens)
        .bind(input.cost)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_token_usage(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<TokenUsageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, task_id, step_name, input_tokens, output_tokens, cost, created_at \
             FROM token_usage WHERE task_id = $1 ORDER BY created_at ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| TokenUsageRecord {
                id: row.get("id"),
                task_id: row.get("task_id"),
                step_name: row.get("step_name"),
                input_tokens: row.get("input_tokens"),
                output_tokens: row.get("output_tokens"),
                cost: row.get("cost"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn record_quality_check(&self, input: NewQualityCheck) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO quality_checks (id, task_id, step_name, passed, score, report) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::now_v7())
        .bind(input.task_id)
        .bind(&input.step_name)
        .bind(input.passed)
        .bind(input.score)
        .bind(&input.report)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_quality_checks(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<QualityCheckRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, task_id, step_name, passed, score, report, created_at \
             FROM quality_checks WHERE task_id = $1 ORDER BY created_at ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| QualityCheckRecord {
                id: row.get("id"),
                task_id: row.get("task_id"),
                step_name: row.get("step_name"),
                passed: row.get("passed"),
                score: row.get("score"),
                report: row.get("report"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}
