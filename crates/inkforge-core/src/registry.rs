//! Workflow registry
//!
//! Maps workflow type names to factories that expose a parameter schema, a
//! channel set, and a compiled graph. The registry is constructed at startup
//! and passed by dependency injection; a process-global instance is provided
//! for surfaces that cannot thread it through, and must be populated before
//! the first `create_graph` call.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::channel::ChannelSet;
use crate::graph::{CompiledGraph, GraphError};
use crate::params::{ParamError, ParamSchema};
use crate::state::{StateUpdate, WorkflowState};

/// Descriptive metadata for a registered workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct WorkflowMetadata {
    pub workflow_type: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

/// A registered workflow definition
///
/// Immutable after registration. `seed_state` receives parameters that have
/// already been validated and default-filled.
pub trait WorkflowFactory: Send + Sync + 'static {
    /// Descriptive metadata (type, version, name, description, tags)
    fn metadata(&self) -> WorkflowMetadata;

    /// Declared parameter schema
    fn param_schema(&self) -> ParamSchema;

    /// The channels the workflow's state is made of
    fn channels(&self) -> ChannelSet;

    /// Build the compiled graph
    fn build_graph(&self) -> Result<CompiledGraph, GraphError>;

    /// Workflow-specific channel seeds derived from validated parameters
    fn seed_state(&self, params: &Map<String, Value>) -> StateUpdate;
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type name was empty
    #[error("workflow type must not be empty")]
    EmptyWorkflowType,

    /// Type already taken
    #[error("workflow type already registered: {0}")]
    AlreadyRegistered(String),

    /// Not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflow(String),

    /// Parameter validation failed
    #[error(transparent)]
    InvalidParams(#[from] ParamError),

    /// Graph construction failed
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Registry of workflow factories
pub struct WorkflowRegistry {
    factories: RwLock<HashMap<String, Arc<dyn WorkflowFactory>>>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// The process-global registry
    ///
    /// Populated once at startup; late registration is allowed but not
    /// coordinated across processes.
    pub fn global() -> &'static Arc<WorkflowRegistry> {
        static GLOBAL: OnceLock<Arc<WorkflowRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(WorkflowRegistry::new()))
    }

    /// Register a workflow factory
    pub fn register(&self, factory: Arc<dyn WorkflowFactory>) -> Result<(), RegistryError> {
        let meta = factory.metadata();
        if meta.workflow_type.trim().is_empty() {
            return Err(RegistryError::EmptyWorkflowType);
        }

        let mut factories = self.factories.write();
        if factories.contains_key(&meta.workflow_type) {
            return Err(RegistryError::AlreadyRegistered(meta.workflow_type));
        }

        info!(workflow_type = %meta.workflow_type, version = %meta.version, "registered workflow");
        factories.insert(meta.workflow_type, factory);
        Ok(())
    }

    /// Remove a registration (supported to enable testing)
    pub fn unregister(&self, workflow_type: &str) -> bool {
        self.factories.write().remove(workflow_type).is_some()
    }

    /// Drop every registration (testing only)
    pub fn clear(&self) {
        self.factories.write().clear();
    }

    /// Whether a type is registered
    pub fn has(&self, workflow_type: &str) -> bool {
        self.factories.read().contains_key(workflow_type)
    }

    /// Number of registered workflows
    pub fn count(&self) -> usize {
        self.factories.read().len()
    }

    /// Metadata for every registered workflow
    pub fn list(&self) -> Vec<WorkflowMetadata> {
        let mut metas: Vec<_> = self
            .factories
            .read()
            .values()
            .map(|f| f.metadata())
            .collect();
        metas.sort_by(|a, b| a.workflow_type.cmp(&b.workflow_type));
        metas
    }

    /// Registered workflows carrying the given tag
    pub fn filter_by_tag(&self, tag: &str) -> Vec<WorkflowMetadata> {
        self.list()
            .into_iter()
            .filter(|m| m.tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Look up a factory, failing on unknown types
    pub fn get(&self, workflow_type: &str) -> Result<Arc<dyn WorkflowFactory>, RegistryError> {
        self.get_optional(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflow(workflow_type.to_string()))
    }

    /// Look up a factory, returning None on unknown types
    pub fn get_optional(&self, workflow_type: &str) -> Option<Arc<dyn WorkflowFactory>> {
        self.factories.read().get(workflow_type).cloned()
    }

    /// Metadata for one workflow
    pub fn get_metadata(&self, workflow_type: &str) -> Result<WorkflowMetadata, RegistryError> {
        Ok(self.get(workflow_type)?.metadata())
    }

    /// Build the compiled graph for a workflow
    pub fn create_graph(&self, workflow_type: &str) -> Result<CompiledGraph, RegistryError> {
        Ok(self.get(workflow_type)?.build_graph()?)
    }

    /// Validate parameters against the declared schema
    pub fn validate_params(
        &self,
        workflow_type: &str,
        params: &Map<String, Value>,
    ) -> Result<(), RegistryError> {
        self.get(workflow_type)?.param_schema().validate(params)?;
        Ok(())
    }

    /// Construct the initial state for a run
    ///
    /// Validates parameters first; invalid input produces no state.
    pub fn create_state(
        &self,
        workflow_type: &str,
        task_id: Uuid,
        mode: &str,
        params: &Map<String, Value>,
    ) -> Result<WorkflowState, RegistryError> {
        let factory = self.get(workflow_type)?;
        let schema = factory.param_schema();
        schema.validate(params)?;
        let filled = schema.apply_defaults(params);

        let channels = factory.channels();
        let mut state =
            WorkflowState::base(task_id, workflow_type, mode).with_channel_defaults(&channels);
        let seed = factory.seed_state(&filled);
        state.apply(&seed, &channels);
        Ok(state)
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field(
                "workflow_types",
                &self.factories.read().keys().cloned().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::graph::{GraphBuilder, END, START};
    use crate::node::FnNode;
    use crate::params::{non_empty_string, ParamDefinition, ParamType};
    use serde_json::json;

    struct EchoWorkflow;

    impl WorkflowFactory for EchoWorkflow {
        fn metadata(&self) -> WorkflowMetadata {
            WorkflowMetadata {
                workflow_type: "echo".to_string(),
                version: "1.0.0".to_string(),
                name: "Echo".to_string(),
                description: "Copies the topic into the output".to_string(),
                tags: vec!["test".to_string()],
            }
        }

        fn param_schema(&self) -> ParamSchema {
            ParamSchema::new(vec![ParamDefinition::required("topic", ParamType::String)
                .with_validator(non_empty_string)])
        }

        fn channels(&self) -> ChannelSet {
            ChannelSet::from_channels([Channel::value("topic", Value::Null)])
        }

        fn build_graph(&self) -> Result<CompiledGraph, GraphError> {
            GraphBuilder::new(self.channels())
                .add_node(Arc::new(FnNode::new("echo", |_ctx, _state| async {
                    Ok(StateUpdate::new())
                })))
                .add_edge(START, "echo")
                .add_edge("echo", END)
                .compile()
        }

        fn seed_state(&self, params: &Map<String, Value>) -> StateUpdate {
            StateUpdate::new().set("topic", params.get("topic").cloned().unwrap_or(Value::Null))
        }
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = WorkflowRegistry::new();
        registry.register(Arc::new(EchoWorkflow)).unwrap();

        assert!(registry.has("echo"));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.filter_by_tag("test").len(), 1);
        assert!(registry.filter_by_tag("absent").is_empty());
        assert!(registry.get("echo").is_ok());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = WorkflowRegistry::new();
        registry.register(Arc::new(EchoWorkflow)).unwrap();
        let err = registry.register(Arc::new(EchoWorkflow)).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_unknown_workflow() {
        let registry = WorkflowRegistry::new();
        assert!(matches!(
            registry.get("ghost"),
            Err(RegistryError::UnknownWorkflow(_))
        ));
        assert!(registry.get_optional("ghost").is_none());
    }

    #[test]
    fn test_create_state_validates_first() {
        let registry = WorkflowRegistry::new();
        registry.register(Arc::new(EchoWorkflow)).unwrap();

        let err = registry
            .create_state("echo", Uuid::now_v7(), "sync", &obj(json!({})))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidParams(_)));

        let state = registry
            .create_state("echo", Uuid::now_v7(), "sync", &obj(json!({"topic": "AI"})))
            .unwrap();
        assert_eq!(state.get_str("topic"), Some("AI"));
        assert_eq!(state.workflow_type(), Some("echo"));
    }

    #[test]
    fn test_unregister_and_clear() {
        let registry = WorkflowRegistry::new();
        registry.register(Arc::new(EchoWorkflow)).unwrap();

        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));

        registry.register(Arc::new(EchoWorkflow)).unwrap();
        registry.clear();
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_create_graph() {
        let registry = WorkflowRegistry::new();
        registry.register(Arc::new(EchoWorkflow)).unwrap();
        let graph = registry.create_graph("echo").unwrap();
        assert_eq!(graph.entry(), "echo");
    }
}
