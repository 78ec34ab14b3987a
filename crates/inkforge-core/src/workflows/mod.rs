//! Built-in workflows

pub mod content_creator;

use std::sync::Arc;
use std::time::Duration;

use crate::providers::ProviderSet;
use crate::quality::QualityCache;
use crate::registry::{RegistryError, WorkflowRegistry};

pub use content_creator::{ContentCreatorWorkflow, CONTENT_CREATOR};

/// Register every built-in workflow
///
/// Call once at startup, before the first `create_graph`.
pub fn register_builtin_workflows(
    registry: &WorkflowRegistry,
    providers: ProviderSet,
) -> Result<(), RegistryError> {
    let cache = Arc::new(QualityCache::new(256, Duration::from_secs(15 * 60)));
    registry.register(Arc::new(
        ContentCreatorWorkflow::new(providers).with_cache(cache),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::sim::SimLlmProvider;

    #[test]
    fn test_register_builtins() {
        let registry = WorkflowRegistry::new();
        let providers = ProviderSet::llm_only(Arc::new(SimLlmProvider::fixed("x")));
        register_builtin_workflows(&registry, providers).unwrap();

        assert!(registry.has(CONTENT_CREATOR));
        assert!(registry.create_graph(CONTENT_CREATOR).is_ok());
    }
}
