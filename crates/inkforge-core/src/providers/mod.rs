//! External provider interfaces
//!
//! The core binds no concrete LLM, search, or image backend; it only fixes
//! the interaction boundary. Simulated implementations live in
//! [`sim`](crate::providers::sim) for tests and offline runs.

pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Error from an external provider call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderError {
    /// Error message (sanitized; never carries credentials or full prompts)
    pub message: String,

    /// Whether the call may be retried
    pub retryable: bool,
}

impl ProviderError {
    /// Create a retryable error (timeouts, rate limits, 5xx)
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable error (bad request, auth)
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Token accounting for one provider call
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Provider-reported cost; the core never computes prices itself
    pub cost: f64,
}

impl TokenUsage {
    /// Sum two usage records
    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cost: self.cost + other.cost,
        }
    }
}

/// A text-generation request
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl LlmRequest {
    /// Create a request from a prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Set the system instruction
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// A text-generation response
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Text-generation backend
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and usage records
    fn name(&self) -> &str;

    /// Generate a completion
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError>;
}

/// One search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Web-search backend
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, limit: usize)
        -> Result<Vec<SearchResult>, ProviderError>;
}

/// One generated image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub url: String,
    pub prompt: String,
}

/// Image-generation backend
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, ProviderError>;
}

/// The provider bundle injected into workflow factories
///
/// Search and image backends are optional; nodes degrade gracefully when they
/// are absent.
#[derive(Clone)]
pub struct ProviderSet {
    pub llm: Arc<dyn LlmProvider>,
    pub search: Option<Arc<dyn SearchProvider>>,
    pub image: Option<Arc<dyn ImageProvider>>,
}

impl ProviderSet {
    /// Bundle with only an LLM backend
    pub fn llm_only(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            search: None,
            image: None,
        }
    }

    /// Attach a search backend
    pub fn with_search(mut self, search: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(search);
        self
    }

    /// Attach an image backend
    pub fn with_image(mut self, image: Arc<dyn ImageProvider>) -> Self {
        self.image = Some(image);
        self
    }
}
