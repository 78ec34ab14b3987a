//! End-to-end pipeline tests
//!
//! Drives the built-in content-creator workflow through the synchronous
//! executor against the in-memory store with simulated providers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use inkforge_core::providers::sim::{SimImageProvider, SimLlmProvider, SimSearchProvider};
use inkforge_core::quality::word_count;
use inkforge_core::{register_builtin_workflows, ProviderSet, WorkflowRegistry, WorkflowState};
use inkforge_runtime::{
    CancelHub, DriverConfig, ExecuteRequest, ExecutionStatus, ExecutorError, FailureKind,
    ProgressBroker, SyncExecutor, SyncExecutorConfig,
};
use inkforge_storage::{InMemoryTaskStore, TaskStatus, TaskStore};

struct Fixture {
    store: Arc<InMemoryTaskStore>,
    executor: SyncExecutor,
}

fn fixture(llm: SimLlmProvider) -> Fixture {
    let store = Arc::new(InMemoryTaskStore::new());
    let registry = Arc::new(WorkflowRegistry::new());
    let providers = ProviderSet::llm_only(Arc::new(llm))
        .with_search(Arc::new(SimSearchProvider::generic()))
        .with_image(Arc::new(SimImageProvider::new()));
    register_builtin_workflows(&registry, providers).unwrap();

    let executor = SyncExecutor::new(
        store.clone(),
        registry,
        Arc::new(ProgressBroker::new()),
        Arc::new(CancelHub::new()),
    )
    .with_config(SyncExecutorConfig {
        total_timeout: Duration::from_secs(30),
        join_poll_interval: Duration::from_millis(20),
    })
    .with_driver_config(DriverConfig {
        node_retry_base: Duration::from_millis(5),
    });

    Fixture { store, executor }
}

fn params(extra: Value) -> Map<String, Value> {
    let mut base = json!({"topic": "AI", "requirements": "a short overview"})
        .as_object()
        .unwrap()
        .clone();
    if let Some(extra) = extra.as_object() {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    base
}

fn pass_json() -> String {
    r#"{"score": 9.0, "dimensions": {"relevance": 9}, "suggestions": []}"#.to_string()
}

fn words(n: usize) -> String {
    vec!["word"; n].join(" ")
}

#[tokio::test]
async fn test_sync_happy_path_respects_word_limit() {
    // outline, draft (within the limit), then the judge verdict
    let f = fixture(SimLlmProvider::sequence(vec![
        "1. intro 2. body 3. close".to_string(),
        words(150),
        pass_json(),
    ]));

    let result = f
        .executor
        .execute(ExecuteRequest::new(
            "content-creator",
            params(json!({"hardConstraints": {"maxWords": 200}})),
        ))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.error.is_none());

    let task = f.store.find_by_id(result.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let results = f.store.get_results(result.task_id).await.unwrap();
    let article = results
        .iter()
        .find(|r| r.result_type == "article")
        .expect("article row");
    assert!(word_count(article.content.as_deref().unwrap()) <= 200);

    // Token accounting flowed through the store
    assert!(result.metadata.tokens_used > 0);
    assert!(result
        .metadata
        .steps_completed
        .iter()
        .any(|s| s == "draft"));
}

#[tokio::test]
async fn test_quality_retry_then_pass() {
    // First draft blows the limit, the revision fits
    let f = fixture(SimLlmProvider::sequence(vec![
        "outline".to_string(),
        words(3000),
        words(1500),
        pass_json(),
    ]));

    let result = f
        .executor
        .execute(ExecuteRequest::new(
            "content-creator",
            params(json!({"hardConstraints": {"maxWords": 2000}})),
        ))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);

    let task = f.store.find_by_id(result.task_id).await.unwrap().unwrap();
    assert_eq!(task.text_retry_count, 1);

    // The producer committed twice: the failed attempt and the revision
    let checkpoints = f.store.list_checkpoints(result.task_id).await.unwrap();
    let draft_commits = checkpoints
        .iter()
        .filter(|c| c.step_name == "draft")
        .count();
    assert_eq!(draft_commits, 2);

    // Both verdicts were recorded durably
    let checks = f.store.get_quality_checks(result.task_id).await.unwrap();
    assert_eq!(checks.len(), 2);
    assert!(!checks[0].passed);
    assert!(checks[1].passed);
}

#[tokio::test]
async fn test_quality_exhaustion_fails_the_run() {
    // Every draft is overlength; the budget is three retries
    let f = fixture(SimLlmProvider::fixed(words(3000)));

    let result = f
        .executor
        .execute(ExecuteRequest::new(
            "content-creator",
            params(json!({
                "hardConstraints": {"maxWords": 2000},
                "maxTextRetries": 3,
            })),
        ))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.kind, FailureKind::QualityExhausted);

    let task = f.store.find_by_id(result.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.text_retry_count, 3);
    assert!(task
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("QualityExhausted"));
}

#[tokio::test]
async fn test_concurrent_submissions_with_same_key_share_a_task() {
    let f = Arc::new(fixture(SimLlmProvider::sequence(vec![
        "outline".to_string(),
        words(50),
        pass_json(),
    ])));

    let request = || {
        ExecuteRequest::new("content-creator", params(json!({})))
            .with_idempotency_key("k-1")
    };

    let (a, b) = tokio::join!(f.executor.execute(request()), f.executor.execute(request()));
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.task_id, b.task_id);
    assert_eq!(f.store.task_count(), 1);

    // Exactly one article row: the join path never re-ran the graph
    let articles = f
        .store
        .get_results(a.task_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.result_type == "article")
        .count();
    assert_eq!(articles, 1);
}

#[tokio::test]
async fn test_idempotency_conflict_on_live_task_with_other_params() {
    let f = Arc::new(fixture(SimLlmProvider::fixed(pass_json()).with_latency(
        Duration::from_millis(200),
    )));

    // Keep the first run alive long enough to collide with
    let first = {
        let f = f.clone();
        tokio::spawn(async move {
            f.executor
                .execute(
                    ExecuteRequest::new("content-creator", params(json!({})))
                        .with_idempotency_key("k-1"),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = f
        .executor
        .execute(
            ExecuteRequest::new("content-creator", params(json!({"topic": "AI'"})))
                .with_idempotency_key("k-1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::IdempotencyConflict));

    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_invalid_params_produce_no_task() {
    let f = fixture(SimLlmProvider::fixed(pass_json()));

    let err = f
        .executor
        .execute(ExecuteRequest::new(
            "content-creator",
            json!({"topic": "AI"}).as_object().unwrap().clone(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Registry(_)));
    assert_eq!(f.store.task_count(), 0);
}

#[tokio::test]
async fn test_unknown_workflow_rejected() {
    let f = fixture(SimLlmProvider::fixed(pass_json()));
    let err = f
        .executor
        .execute(ExecuteRequest::new("ghost", params(json!({}))))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Registry(_)));
}

#[tokio::test]
async fn test_cancellation_mid_run() {
    // A slow LLM gives the canceller time to land between steps
    let f = Arc::new(fixture(
        SimLlmProvider::fixed(pass_json()).with_latency(Duration::from_millis(150)),
    ));

    let run = {
        let f = f.clone();
        tokio::spawn(async move {
            f.executor
                .execute(ExecuteRequest::new("content-creator", params(json!({}))))
                .await
        })
    };

    // Find the running task and cancel it
    let task_id = loop {
        let tasks = f
            .store
            .find_many(Default::default(), Default::default())
            .await
            .unwrap();
        if let Some(task) = tasks.iter().find(|t| t.status == TaskStatus::Running) {
            break task.id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let mut signalled = false;
    for _ in 0..100 {
        if f.executor.cancel(task_id) {
            signalled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(signalled, "run never registered for cancellation");

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);

    let task = f.store.find_by_id(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.worker_id.is_none());
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn test_progress_events_flow_to_subscribers() {
    let f = fixture(SimLlmProvider::sequence(vec![
        "outline".to_string(),
        words(40),
        pass_json(),
    ]));

    // Pre-compute the task id so the subscription exists before the run
    let task_id = uuid::Uuid::now_v7();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    {
        let seen = seen.clone();
        f.executor.progress().on_progress(
            task_id,
            Arc::new(move |event| {
                seen.lock().push(event.current_step.clone());
            }),
        );
    }

    let mut request = ExecuteRequest::new("content-creator", params(json!({})));
    request.task_id = Some(task_id);
    let result = f.executor.execute(request).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    let steps = seen.lock().clone();
    assert!(steps.contains(&"draft".to_string()));
    assert!(steps.contains(&"completed".to_string()));
}

#[tokio::test]
async fn test_final_state_round_trips_through_snapshot() {
    let f = fixture(SimLlmProvider::sequence(vec![
        "outline".to_string(),
        words(30),
        pass_json(),
    ]));

    let result = f
        .executor
        .execute(ExecuteRequest::new("content-creator", params(json!({}))))
        .await
        .unwrap();

    let task = f.store.find_by_id(result.task_id).await.unwrap().unwrap();
    let snapshot = task.state_snapshot.expect("snapshot present");
    let state = WorkflowState::from_value(snapshot).unwrap();
    assert_eq!(state.task_id(), Some(result.task_id));
    assert!(state.get_str("draft").is_some());
}
