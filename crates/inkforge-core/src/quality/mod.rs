//! Two-layer quality checks
//!
//! Hard rules gate first (deterministic, zero-or-full score); the LLM judge
//! runs only when they pass, unless configured to run regardless. The
//! combined [`QualityReport`] feeds conditional routing in the graph.

pub mod cache;
pub mod hard_rules;
pub mod llm_eval;
pub mod report;

pub use cache::{CacheStats, QualityCache};
pub use hard_rules::{
    evaluate as evaluate_hard_rules, word_count, HardRuleReport, HardRules, IssueSeverity,
    KeywordMode, QualityIssue,
};
pub use llm_eval::{LlmEvalConfig, LlmEvaluation, LlmEvaluator};
pub use report::{QualityDetails, QualityReport};

/// Configuration for the quality-check node
#[derive(Debug, Clone)]
pub struct QualityCheckConfig {
    /// Run the LLM judge even when hard rules failed
    pub always_run_llm: bool,

    /// LLM judge configuration
    pub llm: LlmEvalConfig,
}

impl Default for QualityCheckConfig {
    fn default() -> Self {
        Self {
            always_run_llm: false,
            llm: LlmEvalConfig::default(),
        }
    }
}
