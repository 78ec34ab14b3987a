//! Soft LLM evaluation
//!
//! The second quality layer: a judge prompt producing a numeric score in
//! [0, 10] with per-dimension scores and improvement suggestions. Only runs
//! when the hard rules pass, unless configured otherwise.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::node::extract_json;
use crate::providers::{LlmProvider, LlmRequest, ProviderError, TokenUsage};

/// Configuration for the LLM judge
#[derive(Debug, Clone)]
pub struct LlmEvalConfig {
    /// Minimum passing score
    pub threshold: f64,

    /// Scored dimensions
    pub dimensions: Vec<String>,

    /// Completion budget for the judge call
    pub max_tokens: u32,
}

impl Default for LlmEvalConfig {
    fn default() -> Self {
        Self {
            threshold: 7.0,
            dimensions: vec![
                "relevance".to_string(),
                "coherence".to_string(),
                "completeness".to_string(),
                "readability".to_string(),
            ],
            max_tokens: 1024,
        }
    }
}

/// Verdict of the LLM layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmEvaluation {
    /// Overall score in [0, 10]
    pub score: f64,
    pub passed: bool,
    pub dimensions: BTreeMap<String, f64>,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub suggestions: Vec<String>,
}

/// The LLM judge
pub struct LlmEvaluator {
    provider: Arc<dyn LlmProvider>,
    config: LlmEvalConfig,
}

impl LlmEvaluator {
    pub fn new(provider: Arc<dyn LlmProvider>, config: LlmEvalConfig) -> Self {
        Self { provider, config }
    }

    /// Judge an artifact against the submitted requirements
    ///
    /// Returns the evaluation together with the tokens spent on the call so
    /// the caller can record usage.
    pub async fn evaluate(
        &self,
        artifact: &str,
        requirements: &str,
    ) -> Result<(LlmEvaluation, TokenUsage), ProviderError> {
        let request = LlmRequest::new(self.build_prompt(artifact, requirements))
            .with_system(
                "You are a strict content reviewer. Respond with a single JSON object and nothing else.",
            );
        let response = self.provider.generate(request).await?;

        let evaluation = self.parse(&response.text);
        debug!(score = evaluation.score, passed = evaluation.passed, "llm evaluation complete");
        Ok((evaluation, response.usage))
    }

    fn build_prompt(&self, artifact: &str, requirements: &str) -> String {
        let dims = self.config.dimensions.join(", ");
        format!(
            "Review the content below against the requirements.\n\
             Requirements: {requirements}\n\n\
             Score the overall quality from 0 to 10 and each dimension ({dims}) from 0 to 10.\n\
             Reply with JSON: {{\"score\": <number>, \"dimensions\": {{...}}, \
             \"strengths\": [...], \"weaknesses\": [...], \"suggestions\": [...]}}\n\n\
             Content:\n{artifact}"
        )
    }

    /// Parse the judge output, defaulting to a failing verdict on garbage
    fn parse(&self, text: &str) -> LlmEvaluation {
        let value = match extract_json(text) {
            Some(v) => v,
            None => {
                return LlmEvaluation {
                    score: 0.0,
                    passed: false,
                    dimensions: BTreeMap::new(),
                    strengths: vec![],
                    weaknesses: vec!["evaluator returned unparseable output".to_string()],
                    suggestions: vec![],
                }
            }
        };

        let score = value
            .get("score")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 10.0);

        let dimensions = value
            .get("dimensions")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n.clamp(0.0, 10.0))))
                    .collect()
            })
            .unwrap_or_default();

        let string_list = |key: &str| -> Vec<String> {
            value
                .get(key)
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };

        LlmEvaluation {
            score,
            passed: score >= self.config.threshold,
            dimensions,
            strengths: string_list("strengths"),
            weaknesses: string_list("weaknesses"),
            suggestions: string_list("suggestions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::sim::SimLlmProvider;

    fn judge(response: &str) -> LlmEvaluator {
        LlmEvaluator::new(
            Arc::new(SimLlmProvider::fixed(response)),
            LlmEvalConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_passing_evaluation() {
        let evaluator = judge(
            r#"{"score": 8.5, "dimensions": {"relevance": 9, "coherence": 8},
                "strengths": ["clear"], "weaknesses": [], "suggestions": ["tighten intro"]}"#,
        );
        let (eval, usage) = evaluator.evaluate("content", "reqs").await.unwrap();
        assert!(eval.passed);
        assert_eq!(eval.score, 8.5);
        assert_eq!(eval.dimensions["relevance"], 9.0);
        assert_eq!(eval.suggestions, vec!["tighten intro"]);
        assert!(usage.output_tokens > 0);
    }

    #[tokio::test]
    async fn test_failing_evaluation() {
        let evaluator = judge(r#"{"score": 4.0, "suggestions": ["rewrite"]}"#);
        let (eval, _) = evaluator.evaluate("content", "reqs").await.unwrap();
        assert!(!eval.passed);
    }

    #[tokio::test]
    async fn test_unparseable_output_fails_closed() {
        let evaluator = judge("I think it is pretty good!");
        let (eval, _) = evaluator.evaluate("content", "reqs").await.unwrap();
        assert!(!eval.passed);
        assert_eq!(eval.score, 0.0);
    }

    #[tokio::test]
    async fn test_score_clamped() {
        let evaluator = judge(r#"{"score": 42}"#);
        let (eval, _) = evaluator.evaluate("content", "reqs").await.unwrap();
        assert_eq!(eval.score, 10.0);
    }
}
