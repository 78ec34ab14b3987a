//! Durable run recording
//!
//! Bridges the node protocol's record sink to the task store: token usage
//! and quality verdicts land in their append-only tables. Recording is
//! auxiliary; failures are logged and swallowed, never surfaced into the run.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use inkforge_core::{QualityReport, RunRecorder, TokenUsage};
use inkforge_storage::{NewQualityCheck, NewTokenUsage, TaskStore};

/// Recorder backed by the task store
pub struct StoreRecorder {
    store: Arc<dyn TaskStore>,
}

impl StoreRecorder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RunRecorder for StoreRecorder {
    async fn record_usage(&self, task_id: Uuid, step_name: &str, usage: &TokenUsage) {
        let record = NewTokenUsage {
            task_id,
            step_name: step_name.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost: usage.cost,
        };
        if let Err(e) = self.store.record_token_usage(record).await {
            warn!(task_id = %task_id, step = step_name, error = %e, "token usage write failed");
        }
    }

    async fn record_quality_check(
        &self,
        task_id: Uuid,
        step_name: &str,
        report: &QualityReport,
    ) {
        let record = NewQualityCheck {
            task_id,
            step_name: step_name.to_string(),
            passed: report.passed,
            score: report.score,
            report: serde_json::to_value(report).unwrap_or(serde_json::Value::Null),
        };
        if let Err(e) = self.store.record_quality_check(record).await {
            warn!(task_id = %task_id, step = step_name, error = %e, "quality check write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkforge_core::quality::{evaluate_hard_rules, HardRules};
    use inkforge_storage::{InMemoryTaskStore, NewTask, TaskMode};

    #[tokio::test]
    async fn test_records_usage_through_store() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store
            .create_task(NewTask::new("wf", TaskMode::Sync, serde_json::json!({})))
            .await
            .unwrap()
            .task;

        let recorder = StoreRecorder::new(store.clone());
        recorder
            .record_usage(
                task.id,
                "draft",
                &TokenUsage {
                    input_tokens: 12,
                    output_tokens: 34,
                    cost: 0.005,
                },
            )
            .await;

        let records = store.get_token_usage(task.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].step_name, "draft");
        assert_eq!(records[0].output_tokens, 34);
    }

    #[tokio::test]
    async fn test_records_quality_checks_through_store() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store
            .create_task(NewTask::new("wf", TaskMode::Sync, serde_json::json!({})))
            .await
            .unwrap()
            .task;

        let recorder = StoreRecorder::new(store.clone());
        let report =
            QualityReport::combine(evaluate_hard_rules(&HardRules::default(), "fine text"), None);
        recorder.record_quality_check(task.id, "review", &report).await;

        let checks = store.get_quality_checks(task.id).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert!(checks[0].passed);
        assert_eq!(checks[0].score, 10.0);
        assert_eq!(checks[0].step_name, "review");
    }
}
