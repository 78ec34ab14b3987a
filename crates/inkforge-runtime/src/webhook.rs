//! Webhook dispatcher
//!
//! Delivers task lifecycle events to external URLs without ever blocking the
//! producing path: `send` enqueues and returns, a single consumer drains the
//! queue serially with per-attempt timeouts and a fixed retry delay. After
//! the retry budget is spent the event is logged and dropped. Nothing
//! survives a process restart.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Event names on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventKind {
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.progress")]
    TaskProgress,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,
}

impl WebhookEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskProgress => "task.progress",
            Self::TaskCancelled => "task.cancelled",
        }
    }
}

/// The JSON payload POSTed to the callback URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: WebhookEventKind,
    pub task_id: Uuid,
    pub workflow_type: String,
    pub status: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl WebhookEvent {
    pub fn new(
        event: WebhookEventKind,
        task_id: Uuid,
        workflow_type: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            event,
            task_id,
            workflow_type: workflow_type.into(),
            status: status.into(),
            timestamp: Utc::now().to_rfc3339(),
            result: None,
            error: None,
            metadata: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, kind: &str, message: &str) -> Self {
        self.error = Some(serde_json::json!({ "kind": kind, "message": message }));
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Per-callback delivery options (from the submit request)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackOptions {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub url: String,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_s")]
    pub retry_delay_s: u64,
}

fn default_enabled() -> bool {
    true
}
fn default_timeout_s() -> u64 {
    10
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay_s() -> u64 {
    5
}

impl CallbackOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            url: url.into(),
            timeout_s: default_timeout_s(),
            retry_count: default_retry_count(),
            retry_delay_s: default_retry_delay_s(),
        }
    }
}

struct Delivery {
    event: WebhookEvent,
    options: CallbackOptions,
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct WebhookDispatcherConfig {
    pub user_agent: String,
}

impl Default for WebhookDispatcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("inkforge-webhook/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// In-process retrying webhook dispatcher
///
/// One consumer task per dispatcher; producers only pay an unbounded-channel
/// send.
pub struct WebhookDispatcher {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl WebhookDispatcher {
    /// Start the dispatcher and its consumer task
    pub fn new(config: WebhookDispatcherConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .unwrap_or_default();

        tokio::spawn(consume(rx, client));

        Self { tx }
    }

    /// Enqueue an event for delivery; never blocks
    ///
    /// A disabled callback or an empty URL is a successful no-op.
    pub fn send(&self, event: WebhookEvent, options: &CallbackOptions) {
        if !options.enabled || options.url.trim().is_empty() {
            return;
        }
        let delivery = Delivery {
            event,
            options: options.clone(),
        };
        if self.tx.send(delivery).is_err() {
            warn!("webhook consumer is gone, dropping event");
        }
    }
}

async fn consume(mut rx: mpsc::UnboundedReceiver<Delivery>, client: reqwest::Client) {
    while let Some(delivery) = rx.recv().await {
        deliver(&client, delivery).await;
    }
}

/// Deliver one event: fixed-delay retries, then drop
async fn deliver(client: &reqwest::Client, delivery: Delivery) {
    let Delivery { event, options } = delivery;
    let max_attempts = options.retry_count.max(1);

    for attempt in 1..=max_attempts {
        let outcome = client
            .post(&options.url)
            .timeout(Duration::from_secs(options.timeout_s.max(1)))
            .header("X-Webhook-Event", event.event.as_str())
            .header("X-Task-ID", event.task_id.to_string())
            .json(&event)
            .send()
            .await;

        match outcome {
            Ok(response) if matches!(response.status().as_u16(), 200 | 202) => {
                debug!(
                    task_id = %event.task_id,
                    event = event.event.as_str(),
                    attempt,
                    "webhook delivered"
                );
                return;
            }
            Ok(response) => {
                warn!(
                    task_id = %event.task_id,
                    status = response.status().as_u16(),
                    attempt,
                    "webhook rejected"
                );
            }
            Err(e) => {
                warn!(task_id = %event.task_id, attempt, error = %e, "webhook transport failure");
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(Duration::from_secs(options.retry_delay_s)).await;
        }
    }

    // Delivery failures never surface back into the task's state
    error!(
        task_id = %event.task_id,
        event = event.event.as_str(),
        attempts = max_attempts,
        "webhook delivery exhausted, dropping event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server answering each connection with the scripted status
    async fn fake_receiver(statuses: Vec<u16>) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));

        let hits_srv = hits.clone();
        tokio::spawn(async move {
            for status in statuses {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                hits_srv.fetch_add(1, Ordering::SeqCst);

                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let reason = if status == 200 { "OK" } else { "Service Unavailable" };
                let response =
                    format!("HTTP/1.1 {status} {reason}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        (format!("http://{addr}/hook"), hits)
    }

    fn event() -> WebhookEvent {
        WebhookEvent::new(
            WebhookEventKind::TaskCompleted,
            Uuid::now_v7(),
            "content-creator",
            "completed",
        )
    }

    #[tokio::test]
    async fn test_disabled_or_empty_url_is_noop() {
        let dispatcher = WebhookDispatcher::new(WebhookDispatcherConfig::default());

        let mut options = CallbackOptions::new("http://localhost:1/hook");
        options.enabled = false;
        dispatcher.send(event(), &options);

        let options = CallbackOptions::new("");
        dispatcher.send(event(), &options);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let (url, hits) = fake_receiver(vec![503, 503, 200]).await;
        let dispatcher = WebhookDispatcher::new(WebhookDispatcherConfig::default());

        let mut options = CallbackOptions::new(url);
        options.retry_count = 3;
        options.retry_delay_s = 0;

        // Producer returns immediately
        dispatcher.send(event(), &options);

        // Wait for the consumer to work through the retries
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_retry_budget() {
        let (url, hits) = fake_receiver(vec![503, 503, 503, 503]).await;
        let dispatcher = WebhookDispatcher::new(WebhookDispatcherConfig::default());

        let mut options = CallbackOptions::new(url);
        options.retry_count = 2;
        options.retry_delay_s = 0;

        dispatcher.send(event(), &options);
        tokio::time::sleep(Duration::from_millis(300)).await;

        // No more than retry_count attempts were made
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(WebhookEventKind::TaskCompleted.as_str(), "task.completed");
        let json = serde_json::to_value(WebhookEventKind::TaskFailed).unwrap();
        assert_eq!(json, serde_json::json!("task.failed"));
    }

    #[test]
    fn test_callback_options_defaults() {
        let options: CallbackOptions =
            serde_json::from_value(serde_json::json!({"url": "https://example.com/hook"}))
                .unwrap();
        assert!(options.enabled);
        assert_eq!(options.timeout_s, 10);
        assert_eq!(options.retry_count, 3);
        assert_eq!(options.retry_delay_s, 5);
    }
}
