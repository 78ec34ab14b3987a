//! Node protocol
//!
//! A node is a uniform handler `state -> partial_update` with a configured
//! timeout and a handler-level retry budget. Common behavior (JSON extraction
//! from LLM output, token recording) is provided as free helpers invoked by
//! handlers, not as base-class plumbing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::providers::TokenUsage;
use crate::state::{StateUpdate, WorkflowState};

/// Error type for node handler failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeError {
    /// Error message
    pub message: String,

    /// Error kind for programmatic handling (maps onto the run failure taxonomy)
    pub error_type: Option<String>,

    /// Whether this error is retryable at the node level
    pub retryable: bool,
}

impl NodeError {
    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
        }
    }

    /// Create a fatal (non-retryable) error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
        }
    }

    /// Quality-check retries exhausted; fatal for the run
    pub fn quality_exhausted(message: impl Into<String>) -> Self {
        Self::fatal(message).with_type("QualityExhausted")
    }

    /// Set the error kind
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NodeError {}

impl From<crate::providers::ProviderError> for NodeError {
    fn from(err: crate::providers::ProviderError) -> Self {
        Self {
            message: err.message,
            error_type: Some("ProviderError".to_string()),
            retryable: err.retryable,
        }
    }
}

/// Sink for auxiliary per-(task, step) records
///
/// Nodes record token usage and quality verdicts through the context; the
/// storage layer provides the durable implementation. Recording is never on
/// the control path and must never fail the node.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn record_usage(&self, task_id: Uuid, step_name: &str, usage: &TokenUsage);

    async fn record_quality_check(
        &self,
        task_id: Uuid,
        step_name: &str,
        report: &crate::quality::QualityReport,
    ) {
        let _ = (task_id, step_name, report);
    }
}

/// Recorder that drops everything
pub struct NullRecorder;

#[async_trait]
impl RunRecorder for NullRecorder {
    async fn record_usage(&self, _task_id: Uuid, _step_name: &str, _usage: &TokenUsage) {}
}

/// Per-invocation context handed to node handlers
#[derive(Clone)]
pub struct NodeContext {
    /// The task this run belongs to
    pub task_id: Uuid,

    /// 1-based attempt number for this node invocation
    pub attempt: u32,

    /// Cooperative cancellation; handlers should check at I/O suspension points
    pub cancel: CancellationToken,

    /// Auxiliary record sink
    pub recorder: Arc<dyn RunRecorder>,
}

impl NodeContext {
    /// Create a context with no usage recording (tests, ad-hoc runs)
    pub fn detached(task_id: Uuid) -> Self {
        Self {
            task_id,
            attempt: 1,
            cancel: CancellationToken::new(),
            recorder: Arc::new(NullRecorder),
        }
    }

    /// Record token usage for the given step
    pub async fn record_usage(&self, step_name: &str, usage: &TokenUsage) {
        self.recorder
            .record_usage(self.task_id, step_name, usage)
            .await;
    }

    /// Record a quality verdict for the given step
    pub async fn record_quality_check(
        &self,
        step_name: &str,
        report: &crate::quality::QualityReport,
    ) {
        self.recorder
            .record_quality_check(self.task_id, step_name, report)
            .await;
    }
}

/// A uniform graph node
#[async_trait]
pub trait Node: Send + Sync {
    /// Node name, unique within a graph
    fn name(&self) -> &str;

    /// Per-attempt execution deadline
    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Handler-level retry budget (0 = single attempt)
    fn max_retries(&self) -> u32 {
        0
    }

    /// Precondition check before execution
    ///
    /// The default rejects states that already carry an error.
    fn validate(&self, state: &WorkflowState) -> Result<(), NodeError> {
        match state.error_message() {
            Some(err) => Err(NodeError::fatal(format!(
                "state carries an unresolved error: {err}"
            ))),
            None => Ok(()),
        }
    }

    /// Execute the node, producing a partial state update
    async fn execute(
        &self,
        ctx: &NodeContext,
        state: &WorkflowState,
    ) -> Result<StateUpdate, NodeError>;
}

/// Handler function type for [`FnNode`]
pub type NodeFn = Arc<
    dyn Fn(NodeContext, WorkflowState) -> BoxFuture<'static, Result<StateUpdate, NodeError>>
        + Send
        + Sync,
>;

/// A node built from a closure
///
/// Used for pure transforms and in tests; provider-backed nodes implement
/// [`Node`] directly.
pub struct FnNode {
    name: String,
    timeout: Duration,
    max_retries: u32,
    handler: NodeFn,
}

impl FnNode {
    /// Create a node from an async closure
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(NodeContext, WorkflowState) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StateUpdate, NodeError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            timeout: Duration::from_secs(60),
            max_retries: 0,
            handler: Arc::new(move |ctx, state| Box::pin(f(ctx, state))),
        }
    }

    /// Set the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the handler-level retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl Node for FnNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        state: &WorkflowState,
    ) -> Result<StateUpdate, NodeError> {
        (self.handler)(ctx.clone(), state.clone()).await
    }
}

/// Extract the first JSON object from free-form LLM output
///
/// Strips markdown code fences, then locates the first balanced `{...}` and
/// parses it. Returns `None` when no parseable object is present.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let cleaned = strip_code_fences(text);
    let trimmed = cleaned.trim();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let candidate = first_balanced_object(trimmed)?;
    serde_json::from_str(candidate).ok()
}

fn strip_code_fences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_error_kinds() {
        let err = NodeError::retryable("transient");
        assert!(err.retryable);

        let err = NodeError::quality_exhausted("3 retries spent");
        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("QualityExhausted"));
    }

    #[test]
    fn test_default_validate_rejects_errored_state() {
        let node = FnNode::new("noop", |_ctx, _state| async { Ok(StateUpdate::new()) });

        let mut state = WorkflowState::new();
        assert!(node.validate(&state).is_ok());

        state.insert("error", json!("boom"));
        assert!(node.validate(&state).is_err());
    }

    #[tokio::test]
    async fn test_fn_node_executes() {
        let node = FnNode::new("double", |_ctx, state: WorkflowState| async move {
            let n = state.counter("n");
            Ok(StateUpdate::new().set("n", json!(n * 2)))
        });

        let mut state = WorkflowState::new();
        state.insert("n", json!(21));

        let ctx = NodeContext::detached(Uuid::now_v7());
        let update = node.execute(&ctx, &state).await.unwrap();
        assert_eq!(update.iter().next().unwrap().1, &json!(42));
    }

    #[test]
    fn test_extract_json_plain() {
        let v = extract_json(r#"{"score": 8.5, "passed": true}"#).unwrap();
        assert_eq!(v["score"], json!(8.5));
    }

    #[test]
    fn test_extract_json_with_fences_and_prose() {
        let text = "Here is my evaluation:\n```json\n{\"score\": 7, \"notes\": \"ok {braces} inside\"}\n```\nDone.";
        let v = extract_json(text).unwrap();
        assert_eq!(v["score"], json!(7));
    }

    #[test]
    fn test_extract_json_braces_in_strings() {
        let text = r#"noise {"a": "}}{{", "b": 1} trailing"#;
        let v = extract_json(text).unwrap();
        assert_eq!(v["b"], json!(1));
    }

    #[test]
    fn test_extract_json_none() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{unbalanced").is_none());
    }
}
