//! PostgreSQL implementation of JobQueue
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never contend on
//! the same row. Leases are rows with an expiry timestamp; expired leases are
//! reclaimed on the next poll. Pause and close are process-local flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    EnqueueOptions, Job, JobQueue, LeasedJob, NackOutcome, QueueConfig, QueueError, QueueStats,
};

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    task_id UUID NOT NULL,
    workflow_type TEXT NOT NULL,
    params JSONB NOT NULL DEFAULT '{}'::jsonb,
    priority INT NOT NULL DEFAULT 5,
    status TEXT NOT NULL DEFAULT 'pending',
    attempt_count INT NOT NULL DEFAULT 0,
    callback JSONB,
    ready_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    leased_by TEXT,
    lease_expires_at TIMESTAMPTZ,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    completed_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON jobs (priority, created_at) WHERE status = 'pending';

CREATE INDEX IF NOT EXISTS idx_jobs_task ON jobs (task_id);
"#;

/// How often blocked lease calls poll for new work
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// PostgreSQL implementation of JobQueue
pub struct PostgresJobQueue {
    pool: PgPool,
    config: QueueConfig,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl PostgresJobQueue {
    /// Wrap an existing pool and bootstrap the schema
    pub async fn new(pool: PgPool, config: QueueConfig) -> Result<Self, QueueError> {
        for statement in MIGRATIONS.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;
        }
        Ok(Self {
            pool,
            config,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Connect and bootstrap
    pub async fn connect(database_url: &str, config: QueueConfig) -> Result<Self, QueueError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Self::new(pool, config).await
    }

    async fn reclaim_expired(&self) -> Result<(), QueueError> {
        let reclaimed = sqlx::query(
            "UPDATE jobs SET status = 'pending', leased_by = NULL, lease_expires_at = NULL \
             WHERE status = 'leased' AND lease_expires_at < now()",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        if reclaimed.rows_affected() > 0 {
            warn!(count = reclaimed.rows_affected(), "reclaimed expired job leases");
        }
        Ok(())
    }

    async fn try_claim(&self, worker_id: &str) -> Result<Option<LeasedJob>, QueueError> {
        let lease_expires_at = Utc::now()
            + chrono::Duration::from_std(self.config.lease_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let row = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'leased',
                leased_by = $1,
                lease_expires_at = $2,
                attempt_count = attempt_count + 1
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending' AND ready_at <= now()
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, task_id, workflow_type, params, priority, attempt_count,
                      callback, created_at
            "#,
        )
        .bind(worker_id)
        .bind(lease_expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let priority: i32 = row.get("priority");
        let attempt_count: i32 = row.get("attempt_count");
        let callback: Option<serde_json::Value> = row.get("callback");

        let job = Job {
            task_id: row.get("task_id"),
            workflow_type: row.get("workflow_type"),
            params: row.get("params"),
            priority: priority.clamp(1, 10) as u8,
            created_at: row.get("created_at"),
            attempt_count: attempt_count.max(0) as u32,
            callback: callback.and_then(|v| serde_json::from_value(v).ok()),
        };

        debug!(task_id = %job.task_id, attempt = job.attempt_count, "leased job");
        Ok(Some(LeasedJob {
            job,
            lease_id: row.get("id"),
            worker_id: worker_id.to_string(),
        }))
    }

    async fn prune(&self, status: &str, keep: usize) -> Result<(), QueueError> {
        sqlx::query(
            "DELETE FROM jobs WHERE status = $1 AND id IN ( \
                 SELECT id FROM jobs WHERE status = $1 \
                 ORDER BY completed_at DESC NULLS LAST OFFSET $2)",
        )
        .bind(status)
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, mut job: Job, options: EnqueueOptions) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        if let Some(priority) = options.priority {
            job.priority = priority.clamp(1, 10);
        }

        let ready_at = match options.delay {
            Some(delay) if !delay.is_zero() => {
                Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero())
            }
            _ => Utc::now(),
        };

        let callback = job
            .callback
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        sqlx::query(
            "INSERT INTO jobs (id, task_id, workflow_type, params, priority, callback, ready_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(Uuid::now_v7())
        .bind(job.task_id)
        .bind(&job.workflow_type)
        .bind(&job.params)
        .bind(i32::from(job.priority))
        .bind(&callback)
        .bind(ready_at)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn lease(&self, worker_id: &str) -> Result<Option<LeasedJob>, QueueError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            if !self.paused.load(Ordering::SeqCst) {
                self.reclaim_expired().await?;
                if let Some(leased) = self.try_claim(worker_id).await? {
                    return Ok(Some(leased));
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, leased: &LeasedJob) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = now(), leased_by = NULL \
             WHERE id = $1 AND leased_by = $2",
        )
        .bind(leased.lease_id)
        .bind(&leased.worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        self.prune("completed", self.config.retention_completed).await
    }

    async fn nack(&self, leased: &LeasedJob, reason: &str) -> Result<NackOutcome, QueueError> {
        let attempt = leased.job.attempt_count;

        if self.config.retry.has_attempts_remaining(attempt) {
            let delay = self.config.retry.delay_for_attempt(attempt + 1);
            let ready_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

            sqlx::query(
                "UPDATE jobs SET status = 'pending', ready_at = $3, leased_by = NULL, \
                 lease_expires_at = NULL, last_error = $4 \
                 WHERE id = $1 AND leased_by = $2",
            )
            .bind(leased.lease_id)
            .bind(&leased.worker_id)
            .bind(ready_at)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

            Ok(NackOutcome::WillRetry {
                attempt: attempt + 1,
                delay,
            })
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', completed_at = now(), leased_by = NULL, \
                 last_error = $3 \
                 WHERE id = $1 AND leased_by = $2",
            )
            .bind(leased.lease_id)
            .bind(&leased.worker_id)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

            self.prune("failed", self.config.retention_failed).await?;
            Ok(NackOutcome::Discarded)
        }
    }

    async fn remove(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM jobs WHERE task_id = $1 AND status = 'pending'")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending' AND ready_at <= now()) AS waiting,
                COUNT(*) FILTER (WHERE status = 'pending' AND ready_at > now()) AS delayed,
                COUNT(*) FILTER (WHERE status = 'leased') AS active,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        let waiting: i64 = row.get("waiting");
        let delayed: i64 = row.get("delayed");
        let active: i64 = row.get("active");
        let completed: i64 = row.get("completed");
        let failed: i64 = row.get("failed");

        Ok(QueueStats {
            waiting: waiting as usize,
            active: active as usize,
            completed: completed as u64,
            failed: failed as u64,
            delayed: delayed as usize,
        })
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    async fn drain(&self) -> Result<(), QueueError> {
        loop {
            let stats = self.stats().await?;
            if stats.waiting + stats.active + stats.delayed == 0 {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
