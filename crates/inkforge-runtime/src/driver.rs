//! Graph driver
//!
//! Steps a compiled graph against a workflow state: resolves the next node,
//! enforces per-attempt timeouts and node-level retries, applies channel
//! reducers, checkpoints after every committed node, and observes
//! cancellation between steps and at I/O suspension points.
//!
//! Both the synchronous executor and the queue workers drive runs through
//! this type, so resumption and retry semantics are identical on both paths.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use inkforge_core::{
    CompiledGraph, Node, NodeContext, RouteOutcome, RunRecorder, Step, WorkflowState,
};
use inkforge_storage::TaskStore;

use crate::error::{FailureKind, RunFailure};
use crate::progress::{ProgressBroker, ProgressEvent};

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Base for the linear delay between node-level retries
    pub node_retry_base: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            node_retry_base: Duration::from_secs(1),
        }
    }
}

/// A finished run's artifacts
#[derive(Debug)]
pub struct RunOutcome {
    /// The final state at END
    pub state: WorkflowState,

    /// Node names in commit order (revisits included)
    pub steps_completed: Vec<String>,

    /// The task version after the last checkpoint
    pub task_version: i64,
}

/// Drives compiled graphs to completion
pub struct GraphDriver {
    store: Arc<dyn TaskStore>,
    progress: Arc<ProgressBroker>,
    config: DriverConfig,
}

impl GraphDriver {
    pub fn new(store: Arc<dyn TaskStore>, progress: Arc<ProgressBroker>) -> Self {
        Self {
            store,
            progress,
            config: DriverConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Run a graph from the state's current step until END
    ///
    /// `task_version` must match the task row; every checkpoint advances it.
    /// For a resumed run, pass the state restored from the latest checkpoint:
    /// its `current_step` names the last committed node and execution
    /// continues from the edge out of it.
    #[instrument(skip(self, graph, state, cancel, recorder), fields(task_id = %task_id))]
    pub async fn run(
        &self,
        task_id: Uuid,
        task_version: i64,
        graph: &CompiledGraph,
        mut state: WorkflowState,
        cancel: CancellationToken,
        recorder: Arc<dyn RunRecorder>,
    ) -> Result<RunOutcome, RunFailure> {
        let mut version = task_version;
        let mut current = state.current_step().to_string();
        let mut steps_completed = vec![];
        let node_total = graph.node_count().max(1);

        loop {
            if cancel.is_cancelled() {
                return Err(RunFailure::new(FailureKind::Cancelled, "cancellation requested"));
            }

            let next = match graph.route(&current, &state) {
                Ok(step) => step,
                // A raising route is fatal, no retry
                Err(RouteOutcome::Failed(err)) => {
                    return Err(RunFailure::from_node_error(&current, &err))
                }
                Err(RouteOutcome::Graph(err)) => return Err(err.into()),
            };

            let node_name = match next {
                Step::End => break,
                Step::Node(name) => name,
            };
            let node = graph.node(&node_name).ok_or_else(|| {
                RunFailure::new(
                    FailureKind::InvalidRoute,
                    format!("routed to unknown node: {node_name}"),
                )
            })?;

            let update = self
                .invoke_node(task_id, node.as_ref(), &state, &cancel, &recorder)
                .await?;

            // Commit: reduce channels, advance bookkeeping, checkpoint.
            state.apply(&update, graph.channels());
            state.set_current_step(&node_name);
            state.bump_version();

            version = self
                .save_checkpoint(task_id, &node_name, &state, version)
                .await?;

            steps_completed.push(node_name.clone());
            let percentage = (steps_completed.len() * 100 / node_total).min(99) as u8;
            self.progress.notify(&ProgressEvent {
                task_id,
                current_step: node_name.clone(),
                percentage,
                message: format!("completed {node_name}"),
            });

            debug!(node = %node_name, version, "step committed");
            current = node_name;
        }

        info!(steps = steps_completed.len(), "graph run reached end");
        Ok(RunOutcome {
            state,
            steps_completed,
            task_version: version,
        })
    }

    /// Execute one node with validation, timeout, and linear-delay retries
    ///
    /// Retries never advance `current_step`; a cancelled in-flight attempt
    /// has its partial update discarded.
    async fn invoke_node(
        &self,
        task_id: Uuid,
        node: &dyn Node,
        state: &WorkflowState,
        cancel: &CancellationToken,
        recorder: &Arc<dyn RunRecorder>,
    ) -> Result<inkforge_core::StateUpdate, RunFailure> {
        let name = node.name().to_string();
        let max_retries = node.max_retries();
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(RunFailure::new(FailureKind::Cancelled, "cancellation requested"));
            }

            if let Err(err) = node.validate(state) {
                return Err(RunFailure::from_node_error(&name, &err));
            }

            let ctx = NodeContext {
                task_id,
                attempt,
                cancel: cancel.clone(),
                recorder: recorder.clone(),
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RunFailure::new(FailureKind::Cancelled, "cancelled mid-node").at_node(&name));
                }
                result = tokio::time::timeout(node.timeout(), node.execute(&ctx, state)) => result,
            };

            match outcome {
                Ok(Ok(update)) => return Ok(update),

                Ok(Err(err)) if err.retryable && attempt <= max_retries => {
                    warn!(node = %name, attempt, error = %err, "node failed, retrying");
                    tokio::time::sleep(self.config.node_retry_base * attempt).await;
                    attempt += 1;
                }

                Ok(Err(err)) => return Err(RunFailure::from_node_error(&name, &err)),

                Err(_elapsed) if attempt <= max_retries => {
                    warn!(node = %name, attempt, "node timed out, retrying");
                    tokio::time::sleep(self.config.node_retry_base * attempt).await;
                    attempt += 1;
                }

                Err(_elapsed) => {
                    return Err(RunFailure::new(
                        FailureKind::NodeTimeout,
                        format!("node exceeded its {:?} deadline", node.timeout()),
                    )
                    .at_node(&name));
                }
            }
        }
    }

    /// Checkpoint with single-shot contention recovery
    ///
    /// On a CAS miss the task is re-read and the write retried once; the run
    /// fails with a concurrency error if the conflict persists.
    async fn save_checkpoint(
        &self,
        task_id: Uuid,
        step_name: &str,
        state: &WorkflowState,
        expected_version: i64,
    ) -> Result<i64, RunFailure> {
        if let Some(version) = self
            .store
            .save_checkpoint(task_id, step_name, state.to_value(), expected_version)
            .await?
        {
            return Ok(version);
        }

        warn!(task_id = %task_id, step = step_name, "checkpoint contended, re-reading");
        let task = self
            .store
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| RunFailure::new(FailureKind::Concurrency, "task row disappeared"))?;

        self.store
            .save_checkpoint(task_id, step_name, state.to_value(), task.version)
            .await?
            .ok_or_else(|| {
                RunFailure::new(FailureKind::Concurrency, "checkpoint contention persisted")
                    .at_node(step_name)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkforge_core::{
        Channel, ChannelSet, FnNode, GraphBuilder, NodeError, NullRecorder, RouteFn,
        StateUpdate, END, START,
    };
    use inkforge_storage::{InMemoryTaskStore, NewTask, TaskMode};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn setup() -> (Arc<InMemoryTaskStore>, GraphDriver, Uuid) {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store
            .create_task(NewTask::new("test", TaskMode::Sync, json!({})))
            .await
            .unwrap()
            .task;
        let driver = GraphDriver::new(store.clone(), Arc::new(ProgressBroker::new()))
            .with_config(DriverConfig {
                node_retry_base: Duration::from_millis(5),
            });
        (store, driver, task.id)
    }

    fn sink() -> Arc<dyn RunRecorder> {
        Arc::new(NullRecorder)
    }

    #[tokio::test]
    async fn test_linear_run_checkpoints_every_step() {
        let (store, driver, task_id) = setup().await;

        let graph = GraphBuilder::new(ChannelSet::from_channels([Channel::counter("n")]))
            .add_node(Arc::new(FnNode::new("inc", |_ctx, state: WorkflowState| async move {
                Ok(StateUpdate::new().set("n", json!(state.counter("n") + 1)))
            })))
            .add_node(Arc::new(FnNode::new("double", |_ctx, state: WorkflowState| async move {
                Ok(StateUpdate::new().set("n", json!(state.counter("n") * 2)))
            })))
            .add_edge(START, "inc")
            .add_edge("inc", "double")
            .add_edge("double", END)
            .compile()
            .unwrap();

        let state = WorkflowState::base(task_id, "test", "sync")
            .with_channel_defaults(graph.channels());

        let outcome = driver
            .run(task_id, 1, &graph, state, CancellationToken::new(), sink())
            .await
            .unwrap();

        assert_eq!(outcome.state.counter("n"), 2);
        assert_eq!(outcome.steps_completed, vec!["inc", "double"]);
        assert_eq!(outcome.task_version, 3);

        let checkpoints = store.list_checkpoints(task_id).await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].step_name, "inc");
        assert_eq!(checkpoints[1].step_name, "double");
        assert!(checkpoints[0].version < checkpoints[1].version);
    }

    #[tokio::test]
    async fn test_node_retry_then_success() {
        let (_store, driver, task_id) = setup().await;
        let failures = Arc::new(AtomicU32::new(2));

        let failures_in_node = failures.clone();
        let graph = GraphBuilder::new(ChannelSet::new())
            .add_node(Arc::new(
                FnNode::new("flaky", move |_ctx, _state| {
                    let failures = failures_in_node.clone();
                    async move {
                        if failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                            n.checked_sub(1)
                        })
                        .is_ok()
                        {
                            Err(NodeError::retryable("transient"))
                        } else {
                            Ok(StateUpdate::new().set("done", json!(true)))
                        }
                    }
                })
                .with_max_retries(3),
            ))
            .add_edge(START, "flaky")
            .add_edge("flaky", END)
            .compile()
            .unwrap();

        let state = WorkflowState::base(task_id, "test", "sync");
        let outcome = driver
            .run(task_id, 1, &graph, state, CancellationToken::new(), sink())
            .await
            .unwrap();
        assert_eq!(outcome.state.get("done"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_node_retries_exhausted() {
        let (_store, driver, task_id) = setup().await;

        let graph = GraphBuilder::new(ChannelSet::new())
            .add_node(Arc::new(
                FnNode::new("broken", |_ctx, _state| async {
                    Err(NodeError::retryable("always down").with_type("ProviderError"))
                })
                .with_max_retries(1),
            ))
            .add_edge(START, "broken")
            .add_edge("broken", END)
            .compile()
            .unwrap();

        let state = WorkflowState::base(task_id, "test", "sync");
        let err = driver
            .run(task_id, 1, &graph, state, CancellationToken::new(), sink())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Provider);
        assert_eq!(err.node.as_deref(), Some("broken"));
    }

    #[tokio::test]
    async fn test_node_timeout() {
        let (_store, driver, task_id) = setup().await;

        let graph = GraphBuilder::new(ChannelSet::new())
            .add_node(Arc::new(
                FnNode::new("slow", |_ctx, _state| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(StateUpdate::new())
                })
                .with_timeout(Duration::from_millis(20)),
            ))
            .add_edge(START, "slow")
            .add_edge("slow", END)
            .compile()
            .unwrap();

        let state = WorkflowState::base(task_id, "test", "sync");
        let err = driver
            .run(task_id, 1, &graph, state, CancellationToken::new(), sink())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::NodeTimeout);
    }

    #[tokio::test]
    async fn test_cancellation_discards_in_flight_node() {
        let (store, driver, task_id) = setup().await;

        let graph = GraphBuilder::new(ChannelSet::new())
            .add_node(Arc::new(FnNode::new("hang", |_ctx, _state| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(StateUpdate::new().set("leaked", json!(true)))
            })))
            .add_edge(START, "hang")
            .add_edge("hang", END)
            .compile()
            .unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let state = WorkflowState::base(task_id, "test", "sync");
        let err = driver
            .run(task_id, 1, &graph, state, cancel, sink())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Cancelled);

        // The in-flight node's partial update never reached a checkpoint
        assert!(store.list_checkpoints(task_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quality_style_loop_with_counter() {
        let (store, driver, task_id) = setup().await;

        let channels = ChannelSet::from_channels([
            Channel::counter("attempts"),
            Channel::value("passed", json!(false)),
        ]);

        let route: RouteFn = Arc::new(|state: &WorkflowState| {
            if state
                .get("passed")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                Ok("pass".to_string())
            } else if state.counter("attempts") < 3 {
                Ok("retry".to_string())
            } else {
                Err(NodeError::quality_exhausted("budget spent"))
            }
        });

        let graph = GraphBuilder::new(channels)
            .add_node(Arc::new(FnNode::new("produce", |_ctx, _state| async {
                Ok(StateUpdate::new())
            })))
            .add_node(Arc::new(FnNode::new("check", |_ctx, state: WorkflowState| async move {
                let attempts = state.counter("attempts") + 1;
                // Pass on the third attempt
                Ok(StateUpdate::new()
                    .set("attempts", json!(attempts))
                    .set("passed", json!(attempts >= 3)))
            })))
            .add_edge(START, "produce")
            .add_edge("produce", "check")
            .add_conditional_edges(
                "check",
                route,
                [
                    ("pass".to_string(), END.to_string()),
                    ("retry".to_string(), "produce".to_string()),
                ],
            )
            .compile()
            .unwrap();

        let state = WorkflowState::base(task_id, "test", "sync")
            .with_channel_defaults(graph.channels());
        let outcome = driver
            .run(task_id, 1, &graph, state, CancellationToken::new(), sink())
            .await
            .unwrap();

        assert_eq!(outcome.state.counter("attempts"), 3);
        // produce ran three times; each committed node checkpointed
        let produce_runs = outcome
            .steps_completed
            .iter()
            .filter(|s| *s == "produce")
            .count();
        assert_eq!(produce_runs, 3);

        let checkpoints = store.list_checkpoints(task_id).await.unwrap();
        let mut versions: Vec<i64> = checkpoints.iter().map(|c| c.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        assert_eq!(versions, sorted);
        versions.dedup();
        assert_eq!(versions.len(), checkpoints.len());
    }

    #[tokio::test]
    async fn test_route_exhaustion_fails_run() {
        let (_store, driver, task_id) = setup().await;

        let route: RouteFn =
            Arc::new(|_state| Err(NodeError::quality_exhausted("never good enough")));

        let graph = GraphBuilder::new(ChannelSet::new())
            .add_node(Arc::new(FnNode::new("produce", |_ctx, _state| async {
                Ok(StateUpdate::new())
            })))
            .add_edge(START, "produce")
            .add_conditional_edges("produce", route, [("pass".to_string(), END.to_string())])
            .compile()
            .unwrap();

        let state = WorkflowState::base(task_id, "test", "sync");
        let err = driver
            .run(task_id, 1, &graph, state, CancellationToken::new(), sink())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::QualityExhausted);
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint_state() {
        let (store, driver, task_id) = setup().await;

        let channels = ChannelSet::from_channels([Channel::append("log")]);
        let build = |channels: ChannelSet| {
            GraphBuilder::new(channels)
                .add_node(Arc::new(FnNode::new("first", |_ctx, _state| async {
                    Ok(StateUpdate::new().set("log", json!(["first"])))
                })))
                .add_node(Arc::new(FnNode::new("second", |_ctx, _state| async {
                    Ok(StateUpdate::new().set("log", json!(["second"])))
                })))
                .add_edge(START, "first")
                .add_edge("first", "second")
                .add_edge("second", END)
                .compile()
                .unwrap()
        };
        let graph = build(channels.clone());

        // Simulate a crashed run that committed "first"
        let mut state = WorkflowState::base(task_id, "test", "async")
            .with_channel_defaults(graph.channels());
        state.apply(
            &StateUpdate::new().set("log", json!(["first"])),
            graph.channels(),
        );
        state.set_current_step("first");
        state.bump_version();
        let version = store
            .save_checkpoint(task_id, "first", state.to_value(), 1)
            .await
            .unwrap()
            .unwrap();

        // Resume: only "second" runs
        let restored = WorkflowState::from_value(
            store
                .load_latest_checkpoint(task_id)
                .await
                .unwrap()
                .unwrap()
                .state,
        )
        .unwrap();

        let outcome = driver
            .run(task_id, version, &graph, restored, CancellationToken::new(), sink())
            .await
            .unwrap();

        assert_eq!(outcome.steps_completed, vec!["second"]);
        assert_eq!(
            outcome.state.get("log"),
            Some(&json!(["first", "second"]))
        );
    }
}
