//! # Inkforge Workflow Framework
//!
//! The workflow substrate for durable, retry-aware content pipelines.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowRegistry                         │
//! │   (type -> factory: param schema, channels, compiled graph)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CompiledGraph                           │
//! │  (nodes, edges, conditional routes, channel reducers)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Nodes + Providers                         │
//! │  (LLM / search / image calls, quality gate, post-process)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Graph execution (stepping, checkpointing, cancellation) lives in the
//! `inkforge-runtime` crate; this crate defines everything a run is made of.

pub mod channel;
pub mod graph;
pub mod node;
pub mod params;
pub mod providers;
pub mod quality;
pub mod registry;
pub mod state;
pub mod workflows;

/// Prelude for common imports
pub mod prelude {
    pub use crate::channel::{Channel, ChannelSet, Reducer};
    pub use crate::graph::{CompiledGraph, GraphBuilder, GraphError, RouteFn, Step, END, START};
    pub use crate::node::{extract_json, FnNode, Node, NodeContext, NodeError, RunRecorder};
    pub use crate::params::{ParamDefinition, ParamError, ParamSchema, ParamType};
    pub use crate::providers::{
        ImageProvider, LlmProvider, LlmRequest, LlmResponse, ProviderError, ProviderSet,
        SearchProvider, TokenUsage,
    };
    pub use crate::quality::{HardRules, QualityCache, QualityCheckConfig, QualityReport};
    pub use crate::registry::{WorkflowFactory, WorkflowMetadata, WorkflowRegistry};
    pub use crate::state::{StateUpdate, WorkflowState};
}

// Re-export key types at crate root
pub use channel::{Channel, ChannelSet, Reducer};
pub use graph::{CompiledGraph, GraphBuilder, GraphError, RouteFn, RouteOutcome, Step, END, START};
pub use node::{extract_json, FnNode, Node, NodeContext, NodeError, NullRecorder, RunRecorder};
pub use params::{FieldError, ParamDefinition, ParamError, ParamSchema, ParamType};
pub use providers::{
    ImageProvider, LlmProvider, LlmRequest, LlmResponse, ProviderError, ProviderSet,
    SearchProvider, TokenUsage,
};
pub use quality::{HardRules, QualityCache, QualityCheckConfig, QualityReport};
pub use registry::{RegistryError, WorkflowFactory, WorkflowMetadata, WorkflowRegistry};
pub use state::{StateUpdate, WorkflowState};
pub use workflows::register_builtin_workflows;
