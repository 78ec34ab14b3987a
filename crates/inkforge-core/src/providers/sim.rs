//! Simulated providers
//!
//! Fake backends for tests, demos, and offline runs. The LLM simulator
//! supports fixed, sequence, and scripted-failure modes so quality-retry and
//! provider-retry paths can be exercised deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    GeneratedImage, ImageProvider, LlmProvider, LlmRequest, LlmResponse, ProviderError,
    SearchProvider, SearchResult, TokenUsage,
};

/// Response source for the simulated LLM
enum ResponseMode {
    /// Always the same text
    Fixed(String),
    /// One response per call; the last repeats once the list drains
    Sequence(Mutex<VecDeque<String>>, String),
}

/// A fake LLM backend
///
/// Token counts are estimated from whitespace word counts; cost is reported
/// as zero (pricing is a real-provider concern).
pub struct SimLlmProvider {
    mode: ResponseMode,
    latency: Option<Duration>,
    /// Fail this many leading calls with a retryable error before responding
    fail_first: AtomicU32,
    calls: AtomicUsize,
}

impl SimLlmProvider {
    /// Always return the same text
    pub fn fixed(response: impl Into<String>) -> Self {
        Self {
            mode: ResponseMode::Fixed(response.into()),
            latency: None,
            fail_first: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Return each response once, in order, then repeat the last
    pub fn sequence(responses: Vec<String>) -> Self {
        let last = responses.last().cloned().unwrap_or_default();
        Self {
            mode: ResponseMode::Sequence(Mutex::new(responses.into()), last),
            latency: None,
            fail_first: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Simulate per-call latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the first `n` calls with a retryable provider error
    pub fn with_failures(self, n: u32) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    /// Number of generate calls observed
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for SimLlmProvider {
    fn name(&self) -> &str {
        "sim-llm"
    }

    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::retryable("simulated provider outage"));
        }

        let text = match &self.mode {
            ResponseMode::Fixed(t) => t.clone(),
            ResponseMode::Sequence(queue, last) => {
                queue.lock().pop_front().unwrap_or_else(|| last.clone())
            }
        };

        let usage = TokenUsage {
            input_tokens: request.prompt.split_whitespace().count() as i64,
            output_tokens: text.split_whitespace().count() as i64,
            cost: 0.0,
        };

        Ok(LlmResponse { text, usage })
    }
}

/// A fake search backend returning canned hits
pub struct SimSearchProvider {
    results: Vec<SearchResult>,
}

impl SimSearchProvider {
    /// Return the given hits for every query
    pub fn new(results: Vec<SearchResult>) -> Self {
        Self { results }
    }

    /// Two generic hits mentioning the query
    pub fn generic() -> Self {
        Self { results: vec![] }
    }
}

#[async_trait]
impl SearchProvider for SimSearchProvider {
    fn name(&self) -> &str {
        "sim-search"
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        if !self.results.is_empty() {
            return Ok(self.results.iter().take(limit).cloned().collect());
        }
        Ok(vec![
            SearchResult {
                title: format!("Overview of {query}"),
                url: format!("https://example.com/{}", query.replace(' ', "-")),
                snippet: format!("Background material about {query}."),
            },
            SearchResult {
                title: format!("{query} in practice"),
                url: "https://example.com/practice".to_string(),
                snippet: format!("Practical notes on {query}."),
            },
        ]
        .into_iter()
        .take(limit)
        .collect())
    }
}

/// A fake image backend returning placeholder URLs
pub struct SimImageProvider {
    counter: AtomicUsize,
}

impl SimImageProvider {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for SimImageProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageProvider for SimImageProvider {
    fn name(&self) -> &str {
        "sim-image"
    }

    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, ProviderError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(GeneratedImage {
            url: format!("https://images.example.com/sim/{n}.png"),
            prompt: prompt.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_response() {
        let llm = SimLlmProvider::fixed("hello world");
        let resp = llm.generate(LlmRequest::new("hi")).await.unwrap();
        assert_eq!(resp.text, "hello world");
        assert_eq!(resp.usage.output_tokens, 2);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_sequence_repeats_last() {
        let llm = SimLlmProvider::sequence(vec!["a".into(), "b".into()]);
        assert_eq!(llm.generate(LlmRequest::new("x")).await.unwrap().text, "a");
        assert_eq!(llm.generate(LlmRequest::new("x")).await.unwrap().text, "b");
        assert_eq!(llm.generate(LlmRequest::new("x")).await.unwrap().text, "b");
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let llm = SimLlmProvider::fixed("ok").with_failures(2);
        assert!(llm.generate(LlmRequest::new("x")).await.is_err());
        assert!(llm.generate(LlmRequest::new("x")).await.is_err());
        assert!(llm.generate(LlmRequest::new("x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_sim_search_limit() {
        let search = SimSearchProvider::generic();
        let hits = search.search("rust workflows", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].title.contains("rust workflows"));
    }

    #[tokio::test]
    async fn test_sim_image_urls_unique() {
        let images = SimImageProvider::new();
        let a = images.generate_image("sunset").await.unwrap();
        let b = images.generate_image("sunrise").await.unwrap();
        assert_ne!(a.url, b.url);
    }
}
