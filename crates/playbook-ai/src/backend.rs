//! AI backend trait and implementations.
//!
//! The engine only ever asks a backend to `process` a prompt plus the
//! expected input/output schemas and gets structured outputs back. Providers
//! differ in transport, so each one lives behind [`AiBackend`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AiError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Request / Response
// ─────────────────────────────────────────────────────────────────────────────

/// One inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl AiRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            input_schema: None,
            output_schema: None,
            temperature: 0.2,
            max_tokens: 2048,
        }
    }

    pub fn with_schemas(mut self, input: Option<Value>, output: Option<Value>) -> Self {
        self.input_schema = input;
        self.output_schema = output;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Structured result of an inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub outputs: Value,
    /// Model-reported confidence in `[0, 1]`, if any.
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub insights: Option<String>,
    #[serde(default)]
    pub usage: AiUsage,
}

impl AiResponse {
    pub fn new(outputs: Value) -> Self {
        Self {
            outputs,
            confidence: None,
            insights: None,
            usage: AiUsage::default(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_insights(mut self, insights: impl Into<String>) -> Self {
        self.insights = Some(insights.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared Retry Logic
// ─────────────────────────────────────────────────────────────────────────────

/// Execute an async operation with exponential backoff retry.
///
/// Retries only on transient errors (network failures, rate limits).
/// Non-retryable errors are returned immediately.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    backend_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = initial_backoff;
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() || attempt >= max_retries => return Err(e),
            Err(e) => {
                attempt += 1;
                tracing::warn!(
                    backend = backend_name,
                    attempt,
                    max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Request failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AI Backend Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for AI inference providers.
#[async_trait]
pub trait AiBackend: Send + Sync {
    /// Run one inference request and return structured outputs.
    async fn process(&self, request: AiRequest) -> Result<AiResponse>;

    /// Get the name of this backend.
    fn name(&self) -> &str;

    /// Check if the backend is available and properly configured.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// A backend that can be shared across tasks.
pub type SharedAiBackend = Arc<dyn AiBackend>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Backend
// ─────────────────────────────────────────────────────────────────────────────

type MockReply = std::result::Result<AiResponse, String>;

/// A mock backend for tests and offline CLI runs.
///
/// Either replays queued replies in order (erroring once exhausted) or
/// answers every request with the same reply.
#[derive(Debug)]
pub struct MockAiBackend {
    queue: Mutex<VecDeque<MockReply>>,
    fallback: Option<MockReply>,
    request_log: Mutex<Vec<AiRequest>>,
}

impl MockAiBackend {
    /// Replay `responses` in order.
    pub fn new(responses: Vec<AiResponse>) -> Self {
        Self {
            queue: Mutex::new(responses.into_iter().map(Ok).collect()),
            fallback: None,
            request_log: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request with `response`.
    pub fn repeating(response: AiResponse) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Some(Ok(response)),
            request_log: Mutex::new(Vec::new()),
        }
    }

    /// Fail every request with a backend error.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Some(Err(message.into())),
            request_log: Mutex::new(Vec::new()),
        }
    }

    /// Queue a failure ahead of any later replies.
    pub fn push_failure(&self, message: impl Into<String>) {
        self.queue.lock().push_back(Err(message.into()));
    }

    pub fn push_response(&self, response: AiResponse) {
        self.queue.lock().push_back(Ok(response));
    }

    /// Get all requests that were made to this backend.
    pub fn requests(&self) -> Vec<AiRequest> {
        self.request_log.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.request_log.lock().len()
    }
}

#[async_trait]
impl AiBackend for MockAiBackend {
    async fn process(&self, request: AiRequest) -> Result<AiResponse> {
        self.request_log.lock().push(request);

        let reply = match self.queue.lock().pop_front() {
            Some(reply) => reply,
            None => self.fallback.clone().ok_or_else(|| {
                AiError::Backend("MockAiBackend: no more responses available".to_string())
            })?,
        };
        reply.map_err(AiError::Backend)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
