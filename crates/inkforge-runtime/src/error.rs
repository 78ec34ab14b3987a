//! Run failure taxonomy
//!
//! Every way a run can end unsuccessfully, classified so the queue layer can
//! tell retryable failures from fatal ones and the HTTP/CLI edges can map
//! them to status and exit codes.

use serde::{Deserialize, Serialize};

use inkforge_core::{GraphError, NodeError};
use inkforge_storage::StoreError;

/// Classified failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Parameter schema or custom-validator failure; never retried
    InvalidParams,

    /// Workflow type not registered
    UnknownWorkflow,

    /// Idempotency key reused with different parameters
    IdempotencyConflict,

    /// Optimistic-lock mismatch that persisted past local recovery
    Concurrency,

    /// A node exceeded its per-attempt deadline
    NodeTimeout,

    /// The whole run exceeded its deadline
    TotalTimeout,

    /// External LLM / search / image call failed past its retry budget
    Provider,

    /// Quality-check retries exhausted
    QualityExhausted,

    /// Cancellation observed
    Cancelled,

    /// Repository or checkpoint store failure
    Storage,

    /// A conditional route returned an undeclared label, or routing failed
    InvalidRoute,

    /// A node handler failed fatally for any other reason
    NodeFailed,
}

impl FailureKind {
    /// Stable string form used in error messages and webhook payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidParams => "InvalidParams",
            Self::UnknownWorkflow => "UnknownWorkflow",
            Self::IdempotencyConflict => "IdempotencyConflict",
            Self::Concurrency => "ConcurrencyError",
            Self::NodeTimeout => "NodeTimeout",
            Self::TotalTimeout => "TotalTimeout",
            Self::Provider => "ProviderError",
            Self::QualityExhausted => "QualityExhausted",
            Self::Cancelled => "Cancelled",
            Self::Storage => "StorageError",
            Self::InvalidRoute => "InvalidRoute",
            Self::NodeFailed => "NodeFailed",
        }
    }

    /// Whether the queue layer should redeliver the job
    ///
    /// Fatal kinds terminate the task; retryable kinds are nacked so the
    /// queue retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider | Self::Storage | Self::Concurrency)
    }

    /// Parse the stable string form back into a kind
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "InvalidParams" => Some(Self::InvalidParams),
            "UnknownWorkflow" => Some(Self::UnknownWorkflow),
            "IdempotencyConflict" => Some(Self::IdempotencyConflict),
            "ConcurrencyError" => Some(Self::Concurrency),
            "NodeTimeout" => Some(Self::NodeTimeout),
            "TotalTimeout" => Some(Self::TotalTimeout),
            "ProviderError" => Some(Self::Provider),
            "QualityExhausted" => Some(Self::QualityExhausted),
            "Cancelled" => Some(Self::Cancelled),
            "StorageError" => Some(Self::Storage),
            "InvalidRoute" => Some(Self::InvalidRoute),
            "NodeFailed" => Some(Self::NodeFailed),
            _ => None,
        }
    }
}

/// The terminal failure of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
    /// The node being executed when the failure occurred, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl RunFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node: None,
        }
    }

    pub fn at_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// The sanitized message persisted on the task row
    pub fn task_error_message(&self) -> String {
        match &self.node {
            Some(node) => format!("{}: {} (node: {node})", self.kind.as_str(), self.message),
            None => format!("{}: {}", self.kind.as_str(), self.message),
        }
    }

    /// Classify a node handler error using its declared error type
    pub fn from_node_error(node: &str, err: &NodeError) -> Self {
        let kind = match err.error_type.as_deref() {
            Some("QualityExhausted") => FailureKind::QualityExhausted,
            Some("ProviderError") => FailureKind::Provider,
            _ => FailureKind::NodeFailed,
        };
        Self::new(kind, err.message.clone()).at_node(node)
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.task_error_message())
    }
}

impl std::error::Error for RunFailure {}

impl From<StoreError> for RunFailure {
    fn from(err: StoreError) -> Self {
        Self::new(FailureKind::Storage, err.to_string())
    }
}

impl From<GraphError> for RunFailure {
    fn from(err: GraphError) -> Self {
        Self::new(FailureKind::InvalidRoute, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FailureKind::Provider.is_retryable());
        assert!(FailureKind::Storage.is_retryable());
        assert!(FailureKind::Concurrency.is_retryable());
        assert!(!FailureKind::QualityExhausted.is_retryable());
        assert!(!FailureKind::InvalidParams.is_retryable());
        assert!(!FailureKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_node_error_classification() {
        let err = NodeError::quality_exhausted("spent");
        let failure = RunFailure::from_node_error("review", &err);
        assert_eq!(failure.kind, FailureKind::QualityExhausted);
        assert_eq!(failure.node.as_deref(), Some("review"));

        let err = NodeError::retryable("503").with_type("ProviderError");
        let failure = RunFailure::from_node_error("draft", &err);
        assert_eq!(failure.kind, FailureKind::Provider);
    }

    #[test]
    fn test_task_error_message_carries_kind() {
        let failure = RunFailure::new(FailureKind::TotalTimeout, "run exceeded 300s");
        assert!(failure.task_error_message().starts_with("TotalTimeout:"));
    }
}
