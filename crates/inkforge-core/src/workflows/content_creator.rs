//! The content-creator workflow
//!
//! research -> outline -> draft -> review -> illustrate -> assemble
//!
//! The review node writes a combined quality report; its conditional edge
//! loops back to the draft node while the text retry budget lasts and raises
//! quality exhaustion once it is spent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelSet};
use crate::graph::{CompiledGraph, GraphBuilder, GraphError, RouteFn, END, START};
use crate::node::{Node, NodeContext, NodeError};
use crate::params::{non_empty_string, ParamDefinition, ParamSchema, ParamType};
use crate::providers::{LlmRequest, ProviderSet};
use crate::quality::{
    evaluate_hard_rules, HardRules, LlmEvaluator, QualityCache, QualityCheckConfig, QualityReport,
};
use crate::registry::{WorkflowFactory, WorkflowMetadata};
use crate::state::{StateUpdate, WorkflowState};

/// Workflow type name
pub const CONTENT_CREATOR: &str = "content-creator";

const DEFAULT_MAX_TEXT_RETRIES: i64 = 3;

/// Channel names
mod ch {
    pub const TOPIC: &str = "topic";
    pub const REQUIREMENTS: &str = "requirements";
    pub const LANGUAGE: &str = "language";
    pub const HARD_RULES: &str = "hard_rules";
    pub const RESEARCH: &str = "research";
    pub const OUTLINE: &str = "outline";
    pub const DRAFT: &str = "draft";
    pub const ARTICLE: &str = "article";
    pub const IMAGES: &str = "images";
    pub const IMAGE_COUNT: &str = "image_count";
    pub const QUALITY_REPORT: &str = "quality_report";
    pub const TEXT_RETRY_COUNT: &str = "text_retry_count";
    pub const MAX_TEXT_RETRIES: &str = "max_text_retries";
    pub const RESULTS: &str = "results";
}

/// Factory for the content-creator workflow
pub struct ContentCreatorWorkflow {
    providers: ProviderSet,
    cache: Option<Arc<QualityCache>>,
    quality: QualityCheckConfig,
}

impl ContentCreatorWorkflow {
    pub fn new(providers: ProviderSet) -> Self {
        Self {
            providers,
            cache: None,
            quality: QualityCheckConfig::default(),
        }
    }

    /// Share a verdict cache across runs
    pub fn with_cache(mut self, cache: Arc<QualityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Override the quality-check configuration
    pub fn with_quality_config(mut self, quality: QualityCheckConfig) -> Self {
        self.quality = quality;
        self
    }
}

impl WorkflowFactory for ContentCreatorWorkflow {
    fn metadata(&self) -> WorkflowMetadata {
        WorkflowMetadata {
            workflow_type: CONTENT_CREATOR.to_string(),
            version: "1.2.0".to_string(),
            name: "Content Creator".to_string(),
            description: "Researches a topic, drafts an article, gates it through quality \
                          checks, and optionally illustrates it"
                .to_string(),
            tags: vec!["content".to_string(), "article".to_string()],
        }
    }

    fn param_schema(&self) -> ParamSchema {
        ParamSchema::new(vec![
            ParamDefinition::required("topic", ParamType::String)
                .with_description("Subject of the article")
                .with_example(json!("Rust async runtimes"))
                .with_validator(non_empty_string),
            ParamDefinition::required("requirements", ParamType::String)
                .with_description("What the article must deliver")
                .with_example(json!("An 800 word introduction for practitioners"))
                .with_validator(non_empty_string),
            ParamDefinition::optional("hardConstraints", ParamType::Object)
                .with_description("Deterministic quality gates (word counts, keywords, structure)")
                .with_example(json!({"maxWords": 2000, "requiredKeywords": ["async"]}))
                .with_validator(|value| {
                    let rules: HardRules = serde_json::from_value(value.clone())
                        .map_err(|e| format!("unrecognized hard constraints: {e}"))?;
                    if let (Some(min), Some(max)) = (rules.min_words, rules.max_words) {
                        if min > max {
                            return Err(format!(
                                "minWords ({min}) must not exceed maxWords ({max})"
                            ));
                        }
                    }
                    Ok(())
                }),
            ParamDefinition::optional("imageCount", ParamType::Number)
                .with_default(json!(0))
                .with_description("Number of illustrations to generate")
                .with_validator(|value| match value.as_u64() {
                    Some(n) if n <= 10 => Ok(()),
                    _ => Err("must be an integer between 0 and 10".to_string()),
                }),
            ParamDefinition::optional("maxTextRetries", ParamType::Number)
                .with_default(json!(DEFAULT_MAX_TEXT_RETRIES))
                .with_description("Quality-gate retry budget for the draft")
                .with_validator(|value| match value.as_u64() {
                    Some(n) if n <= 10 => Ok(()),
                    _ => Err("must be an integer between 0 and 10".to_string()),
                }),
            ParamDefinition::optional("language", ParamType::String)
                .with_default(json!("en"))
                .with_description("Output language code"),
        ])
    }

    fn channels(&self) -> ChannelSet {
        ChannelSet::from_channels([
            Channel::value(ch::TOPIC, Value::Null),
            Channel::value(ch::REQUIREMENTS, Value::Null),
            Channel::value(ch::LANGUAGE, json!("en")),
            Channel::value(ch::HARD_RULES, Value::Null),
            Channel::value(ch::RESEARCH, json!([])),
            Channel::value(ch::OUTLINE, Value::Null),
            Channel::value(ch::DRAFT, Value::Null),
            Channel::value(ch::ARTICLE, Value::Null),
            Channel::append(ch::IMAGES),
            Channel::value(ch::IMAGE_COUNT, json!(0)),
            Channel::value(ch::QUALITY_REPORT, Value::Null),
            Channel::counter(ch::TEXT_RETRY_COUNT),
            Channel::value(ch::MAX_TEXT_RETRIES, json!(DEFAULT_MAX_TEXT_RETRIES)),
            Channel::append(ch::RESULTS),
        ])
    }

    fn build_graph(&self) -> Result<CompiledGraph, GraphError> {
        let review_route: RouteFn = Arc::new(review_route);

        GraphBuilder::new(self.channels())
            .add_node(Arc::new(ResearchNode {
                providers: self.providers.clone(),
            }))
            .add_node(Arc::new(OutlineNode {
                providers: self.providers.clone(),
            }))
            .add_node(Arc::new(DraftNode {
                providers: self.providers.clone(),
            }))
            .add_node(Arc::new(ReviewNode {
                providers: self.providers.clone(),
                cache: self.cache.clone(),
                config: self.quality.clone(),
            }))
            .add_node(Arc::new(IllustrateNode {
                providers: self.providers.clone(),
            }))
            .add_node(Arc::new(AssembleNode))
            .add_edge(START, "research")
            .add_edge("research", "outline")
            .add_edge("outline", "draft")
            .add_edge("draft", "review")
            .add_conditional_edges(
                "review",
                review_route,
                [
                    ("pass".to_string(), "illustrate".to_string()),
                    ("retry".to_string(), "draft".to_string()),
                ],
            )
            .add_edge("illustrate", "assemble")
            .add_edge("assemble", END)
            .compile()
    }

    fn seed_state(&self, params: &Map<String, Value>) -> StateUpdate {
        let mut update = StateUpdate::new()
            .set(ch::TOPIC, params.get("topic").cloned().unwrap_or(Value::Null))
            .set(
                ch::REQUIREMENTS,
                params.get("requirements").cloned().unwrap_or(Value::Null),
            );
        if let Some(rules) = params.get("hardConstraints") {
            update = update.set(ch::HARD_RULES, rules.clone());
        }
        if let Some(count) = params.get("imageCount") {
            update = update.set(ch::IMAGE_COUNT, count.clone());
        }
        if let Some(retries) = params.get("maxTextRetries") {
            update = update.set(ch::MAX_TEXT_RETRIES, retries.clone());
        }
        if let Some(language) = params.get("language") {
            update = update.set(ch::LANGUAGE, language.clone());
        }
        update
    }
}

/// Routing after the review node
///
/// Reads the post-update state: pass, retry within budget, or raise quality
/// exhaustion once the budget is spent.
fn review_route(state: &WorkflowState) -> Result<String, NodeError> {
    let passed = state
        .get(ch::QUALITY_REPORT)
        .and_then(|r| r.get("passed"))
        .and_then(|p| p.as_bool())
        .unwrap_or(false);
    if passed {
        return Ok("pass".to_string());
    }

    let retries = state.counter(ch::TEXT_RETRY_COUNT);
    let budget = state
        .get(ch::MAX_TEXT_RETRIES)
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_MAX_TEXT_RETRIES);

    if retries < budget {
        Ok("retry".to_string())
    } else {
        Err(NodeError::quality_exhausted(format!(
            "quality gate failed after {retries} retries"
        )))
    }
}

fn require_str<'a>(state: &'a WorkflowState, key: &str) -> Result<&'a str, NodeError> {
    state
        .get_str(key)
        .ok_or_else(|| NodeError::fatal(format!("required channel missing: {key}")))
}

/// Gathers background material through the search provider, when present
struct ResearchNode {
    providers: ProviderSet,
}

#[async_trait]
impl Node for ResearchNode {
    fn name(&self) -> &str {
        "research"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn execute(
        &self,
        _ctx: &NodeContext,
        state: &WorkflowState,
    ) -> Result<StateUpdate, NodeError> {
        let topic = require_str(state, ch::TOPIC)?;

        let search = match &self.providers.search {
            Some(search) => search,
            None => {
                debug!("no search provider configured, skipping research");
                return Ok(StateUpdate::new());
            }
        };

        let hits = search.search(topic, 5).await?;
        Ok(StateUpdate::new().set(ch::RESEARCH, serde_json::to_value(hits).unwrap_or(json!([]))))
    }
}

/// Produces an outline for the draft
struct OutlineNode {
    providers: ProviderSet,
}

#[async_trait]
impl Node for OutlineNode {
    fn name(&self) -> &str {
        "outline"
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        state: &WorkflowState,
    ) -> Result<StateUpdate, NodeError> {
        let topic = require_str(state, ch::TOPIC)?;
        let requirements = require_str(state, ch::REQUIREMENTS)?;

        let mut prompt = format!(
            "Produce a short outline for an article.\nTopic: {topic}\nRequirements: {requirements}\n"
        );
        if let Some(research) = state.get(ch::RESEARCH).filter(|r| !is_empty_array(r)) {
            prompt.push_str(&format!("Background material: {research}\n"));
        }

        let response = self.providers.llm.generate(LlmRequest::new(prompt)).await?;
        ctx.record_usage(self.name(), &response.usage).await;

        Ok(StateUpdate::new().set(ch::OUTLINE, json!(response.text)))
    }
}

/// Writes (or revises) the draft
struct DraftNode {
    providers: ProviderSet,
}

#[async_trait]
impl Node for DraftNode {
    fn name(&self) -> &str {
        "draft"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        state: &WorkflowState,
    ) -> Result<StateUpdate, NodeError> {
        let topic = require_str(state, ch::TOPIC)?;
        let requirements = require_str(state, ch::REQUIREMENTS)?;
        let language = state.get_str(ch::LANGUAGE).unwrap_or("en");

        let mut prompt = format!(
            "Write the article.\nTopic: {topic}\nRequirements: {requirements}\nLanguage: {language}\n"
        );
        if let Some(outline) = state.get_str(ch::OUTLINE) {
            prompt.push_str(&format!("Outline:\n{outline}\n"));
        }

        // A failed review feeds its suggestions back into the revision
        let suggestions: Vec<String> = state
            .get(ch::QUALITY_REPORT)
            .and_then(|r| r.get("fix_suggestions"))
            .and_then(|s| serde_json::from_value(s.clone()).ok())
            .unwrap_or_default();
        if !suggestions.is_empty() {
            prompt.push_str("Revise the previous attempt. Address these issues:\n");
            for s in &suggestions {
                prompt.push_str(&format!("- {s}\n"));
            }
        }

        let response = self.providers.llm.generate(LlmRequest::new(prompt)).await?;
        ctx.record_usage(self.name(), &response.usage).await;

        Ok(StateUpdate::new().set(ch::DRAFT, json!(response.text)))
    }
}

/// Two-layer quality gate over the draft
struct ReviewNode {
    providers: ProviderSet,
    cache: Option<Arc<QualityCache>>,
    config: QualityCheckConfig,
}

#[async_trait]
impl Node for ReviewNode {
    fn name(&self) -> &str {
        "review"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(90)
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        state: &WorkflowState,
    ) -> Result<StateUpdate, NodeError> {
        let draft = require_str(state, ch::DRAFT)?;
        let requirements = state.get_str(ch::REQUIREMENTS).unwrap_or_default();

        let rules: HardRules = state
            .get(ch::HARD_RULES)
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let cache_key = QualityCache::key(draft, "combined");
        let report = match self.cache.as_ref().and_then(|c| c.get(&cache_key)) {
            Some(cached) => {
                debug!(task_id = %ctx.task_id, "quality verdict served from cache");
                cached
            }
            None => {
                let hard = evaluate_hard_rules(&rules, draft);

                let llm = if hard.passed || self.config.always_run_llm {
                    let evaluator =
                        LlmEvaluator::new(self.providers.llm.clone(), self.config.llm.clone());
                    let (eval, usage) = evaluator.evaluate(draft, requirements).await?;
                    ctx.record_usage(self.name(), &usage).await;
                    Some(eval)
                } else {
                    None
                };

                let report = QualityReport::combine(hard, llm);
                if let Some(cache) = &self.cache {
                    cache.put(cache_key, report.clone());
                }
                report
            }
        };

        ctx.record_quality_check(self.name(), &report).await;

        let mut update = StateUpdate::new().set(
            ch::QUALITY_REPORT,
            serde_json::to_value(&report)
                .map_err(|e| NodeError::fatal(format!("quality report serialization: {e}")))?,
        );

        if !report.passed {
            warn!(task_id = %ctx.task_id, score = report.score, "quality gate failed");
            let retries = state.counter(ch::TEXT_RETRY_COUNT);
            update = update.set(ch::TEXT_RETRY_COUNT, json!(retries + 1));
        }

        Ok(update)
    }
}

/// Generates the requested number of illustrations
struct IllustrateNode {
    providers: ProviderSet,
}

#[async_trait]
impl Node for IllustrateNode {
    fn name(&self) -> &str {
        "illustrate"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn execute(
        &self,
        _ctx: &NodeContext,
        state: &WorkflowState,
    ) -> Result<StateUpdate, NodeError> {
        let count = state
            .get(ch::IMAGE_COUNT)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if count == 0 {
            return Ok(StateUpdate::new());
        }

        let image = match &self.providers.image {
            Some(image) => image,
            None => {
                debug!("no image provider configured, skipping illustrations");
                return Ok(StateUpdate::new());
            }
        };

        let topic = require_str(state, ch::TOPIC)?;
        let already = state
            .get(ch::IMAGES)
            .and_then(|v| v.as_array())
            .map(|a| a.len() as u64)
            .unwrap_or(0);

        let mut generated = vec![];
        for i in already..count {
            let prompt = format!("Illustration {} of {count} for an article about {topic}", i + 1);
            let img = image.generate_image(&prompt).await?;
            generated.push(serde_json::to_value(img).unwrap_or(Value::Null));
        }

        Ok(StateUpdate::new().set(ch::IMAGES, Value::Array(generated)))
    }
}

/// Substitutes image placeholders and emits the final artifacts
struct AssembleNode;

#[async_trait]
impl Node for AssembleNode {
    fn name(&self) -> &str {
        "assemble"
    }

    async fn execute(
        &self,
        _ctx: &NodeContext,
        state: &WorkflowState,
    ) -> Result<StateUpdate, NodeError> {
        let draft = require_str(state, ch::DRAFT)?;

        let images: Vec<Value> = state
            .get(ch::IMAGES)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let article = substitute_image_placeholders(draft, &images);

        let mut results = vec![json!({
            "result_type": "article",
            "content": article,
            "metadata": {
                "word_count": crate::quality::word_count(&article),
                "image_count": images.len(),
            },
        })];
        for img in &images {
            results.push(json!({
                "result_type": "image",
                "file_path": img.get("url").cloned().unwrap_or(Value::Null),
                "metadata": { "prompt": img.get("prompt").cloned().unwrap_or(Value::Null) },
            }));
        }

        Ok(StateUpdate::new()
            .set(ch::ARTICLE, json!(article))
            .set(ch::RESULTS, Value::Array(results)))
    }
}

/// Replace `{{image:N}}` placeholders with image URLs
///
/// Placeholders without a matching image are removed; images without a
/// placeholder are left to the caller (listed as separate results).
fn substitute_image_placeholders(text: &str, images: &[Value]) -> String {
    static PLACEHOLDER: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let mut out = text.to_string();
    for (i, img) in images.iter().enumerate() {
        let url = img.get("url").and_then(|u| u.as_str()).unwrap_or_default();
        out = out.replace(&format!("{{{{image:{}}}}}", i + 1), url);
    }
    // Drop leftover placeholders for images that were never produced
    let re = PLACEHOLDER
        .get_or_init(|| regex::Regex::new(r"\{\{image:\d+\}\}").expect("static pattern"));
    re.replace_all(&out, "").into_owned()
}

fn is_empty_array(value: &Value) -> bool {
    value.as_array().map(|a| a.is_empty()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::sim::{SimImageProvider, SimLlmProvider, SimSearchProvider};
    use uuid::Uuid;

    fn providers(llm: SimLlmProvider) -> ProviderSet {
        ProviderSet::llm_only(Arc::new(llm))
            .with_search(Arc::new(SimSearchProvider::generic()))
            .with_image(Arc::new(SimImageProvider::new()))
    }

    fn factory() -> ContentCreatorWorkflow {
        ContentCreatorWorkflow::new(providers(SimLlmProvider::fixed("text")))
    }

    #[test]
    fn test_graph_compiles() {
        let graph = factory().build_graph().unwrap();
        assert_eq!(graph.entry(), "research");
        assert_eq!(graph.node_count(), 6);
    }

    #[test]
    fn test_param_schema_rejects_inverted_word_bounds() {
        let schema = factory().param_schema();
        let input = serde_json::json!({
            "topic": "t",
            "requirements": "r",
            "hardConstraints": {"minWords": 500, "maxWords": 100},
        });
        let err = schema.validate(input.as_object().unwrap()).unwrap_err();
        assert_eq!(err.fields[0].field, "hardConstraints");
    }

    #[test]
    fn test_review_route_decisions() {
        let mut state = WorkflowState::new();
        state.insert(ch::MAX_TEXT_RETRIES, json!(3));

        state.insert(ch::QUALITY_REPORT, json!({"passed": true}));
        assert_eq!(review_route(&state).unwrap(), "pass");

        state.insert(ch::QUALITY_REPORT, json!({"passed": false}));
        state.insert(ch::TEXT_RETRY_COUNT, json!(1));
        assert_eq!(review_route(&state).unwrap(), "retry");

        state.insert(ch::TEXT_RETRY_COUNT, json!(3));
        let err = review_route(&state).unwrap_err();
        assert_eq!(err.error_type.as_deref(), Some("QualityExhausted"));
    }

    #[tokio::test]
    async fn test_review_node_increments_retry_counter_on_failure() {
        let workflow = ContentCreatorWorkflow::new(providers(SimLlmProvider::fixed(
            r#"{"score": 2.0, "suggestions": ["rewrite it"]}"#,
        )));
        let graph = workflow.build_graph().unwrap();
        let review = graph.node("review").unwrap();

        let mut state = WorkflowState::new().with_channel_defaults(graph.channels());
        state.insert(ch::DRAFT, json!("a mediocre draft"));
        state.insert(ch::REQUIREMENTS, json!("be great"));

        let ctx = NodeContext::detached(Uuid::now_v7());
        let update = review.execute(&ctx, &state).await.unwrap();
        state.apply(&update, graph.channels());

        assert_eq!(state.counter(ch::TEXT_RETRY_COUNT), 1);
        let report = state.get(ch::QUALITY_REPORT).unwrap();
        assert_eq!(report["passed"], json!(false));
        assert!(report["fix_suggestions"]
            .as_array()
            .unwrap()
            .contains(&json!("rewrite it")));
    }

    #[tokio::test]
    async fn test_review_node_skips_llm_when_hard_rules_fail() {
        let llm = Arc::new(SimLlmProvider::fixed(r#"{"score": 9.9}"#));
        let workflow = ContentCreatorWorkflow::new(ProviderSet::llm_only(llm.clone()));
        let graph = workflow.build_graph().unwrap();
        let review = graph.node("review").unwrap();

        let mut state = WorkflowState::new().with_channel_defaults(graph.channels());
        state.insert(ch::DRAFT, json!("way too many words for this limit"));
        state.insert(ch::REQUIREMENTS, json!("short"));
        state.insert(ch::HARD_RULES, json!({"maxWords": 2}));

        let ctx = NodeContext::detached(Uuid::now_v7());
        let update = review.execute(&ctx, &state).await.unwrap();
        state.apply(&update, graph.channels());

        // Hard rules failed, so the judge was never consulted
        assert_eq!(llm.call_count(), 0);
        let report = state.get(ch::QUALITY_REPORT).unwrap();
        assert_eq!(report["hard_constraints_passed"], json!(false));
    }

    #[tokio::test]
    async fn test_assemble_substitutes_placeholders() {
        let mut state = WorkflowState::new();
        state.insert(ch::DRAFT, json!("Intro {{image:1}} outro {{image:2}}"));
        state.insert(
            ch::IMAGES,
            json!([{"url": "https://img/1.png", "prompt": "p1"}]),
        );

        let ctx = NodeContext::detached(Uuid::now_v7());
        let update = AssembleNode.execute(&ctx, &state).await.unwrap();
        state.apply(&update, &ChannelSet::new());

        let article = state.get_str(ch::ARTICLE).unwrap();
        assert!(article.contains("https://img/1.png"));
        assert!(!article.contains("{{image:2}}"));
    }

    #[tokio::test]
    async fn test_illustrate_respects_image_count() {
        let workflow = factory();
        let graph = workflow.build_graph().unwrap();
        let illustrate = graph.node("illustrate").unwrap();

        let mut state = WorkflowState::new().with_channel_defaults(graph.channels());
        state.insert(ch::TOPIC, json!("rust"));
        state.insert(ch::IMAGE_COUNT, json!(2));

        let ctx = NodeContext::detached(Uuid::now_v7());
        let update = illustrate.execute(&ctx, &state).await.unwrap();
        state.apply(&update, graph.channels());

        assert_eq!(state.get(ch::IMAGES).unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_seed_state_maps_params() {
        let workflow = factory();
        let params = serde_json::json!({
            "topic": "AI",
            "requirements": "200 words",
            "hardConstraints": {"maxWords": 200},
            "imageCount": 1,
            "maxTextRetries": 2,
        });
        let seed = workflow.seed_state(params.as_object().unwrap());

        let mut state = WorkflowState::new().with_channel_defaults(&workflow.channels());
        state.apply(&seed, &workflow.channels());

        assert_eq!(state.get_str(ch::TOPIC), Some("AI"));
        assert_eq!(state.get(ch::HARD_RULES).unwrap()["maxWords"], json!(200));
        assert_eq!(state.get(ch::MAX_TEXT_RETRIES), Some(&json!(2)));
    }
}
