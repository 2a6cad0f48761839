//! Anthropic Messages API backend.
//!
//! The prompt is sent as a single user message under a system prompt that
//! asks for a JSON object `{outputs, confidence, insights}`. The text reply is
//! parsed leniently: surrounding prose and code fences are ignored, and a bare
//! object without an `outputs` key is taken as the outputs themselves.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{AiBackend, AiRequest, AiResponse, AiUsage, with_retry};
use crate::error::{AiError, Result};

/// Default API base URL.
const DEFAULT_API_BASE: &str = "https://api.anthropic.com";

/// Default API version.
const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Default timeout for requests.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

const SYSTEM_PROMPT: &str = "You execute one step of an automated business workflow. \
Respond with a single JSON object and nothing else, shaped as \
{\"outputs\": <object matching the expected output schema>, \
\"confidence\": <number between 0 and 1>, \
\"insights\": <short plain-text observation>}.";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the Anthropic backend.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub api_version: String,
    pub timeout: Duration,
    /// Maximum retries for transient errors.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_API_BASE.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Anthropic Backend
// ─────────────────────────────────────────────────────────────────────────────

pub struct AnthropicBackend {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicBackend {
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AiError::Config("Anthropic API key is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AiError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    fn add_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.api_version)
            .header(header::CONTENT_TYPE, "application/json")
    }

    fn build_body(request: &AiRequest) -> Result<ApiRequest> {
        let mut content = request.prompt.clone();
        if let Some(ref schema) = request.output_schema {
            content.push_str("\n\nExpected output schema:\n");
            content.push_str(&serde_json::to_string_pretty(schema)?);
        }
        Ok(ApiRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![ApiMessage {
                role: "user".to_string(),
                content,
            }],
        })
    }

    async fn handle_response(response: Response) -> Result<AiResponse> {
        if !response.status().is_success() {
            return Err(Self::handle_error_response(response).await);
        }

        let body = response.text().await?;
        let parsed: ApiResponse = serde_json::from_str(&body)?;
        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let mut result = parse_reply(&text)?;
        result.usage = AiUsage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        };
        Ok(result)
    }

    async fn handle_error_response(response: Response) -> AiError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| format!("HTTP {}: {}", status, body));

        match status.as_u16() {
            401 | 403 => AiError::Auth(message),
            429 => AiError::RateLimit(message),
            // Overloaded and gateway errors are worth another try.
            500..=599 => AiError::Network(format!("Server error: {}", message)),
            _ => AiError::Backend(message),
        }
    }
}

#[async_trait]
impl AiBackend for AnthropicBackend {
    async fn process(&self, request: AiRequest) -> Result<AiResponse> {
        let body = Self::build_body(&request)?;
        tracing::debug!(model = %request.model, "Sending AI step request");

        with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            "anthropic",
            || async {
                let response = self
                    .add_headers(self.client.post(self.messages_url()))
                    .json(&body)
                    .send()
                    .await?;
                Self::handle_response(response).await
            },
        )
        .await
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Extract the structured reply from free-form model text.
fn parse_reply(text: &str) -> Result<AiResponse> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json_text = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => {
            return Err(AiError::InvalidResponse(format!(
                "no JSON object in reply: {}",
                truncate(text, 200)
            )));
        }
    };
    let value: Value = serde_json::from_str(json_text)
        .map_err(|e| AiError::InvalidResponse(format!("malformed JSON in reply: {e}")))?;
    let Value::Object(mut map) = value else {
        return Err(AiError::InvalidResponse("reply is not an object".into()));
    };

    match map.remove("outputs") {
        Some(outputs) => Ok(AiResponse {
            outputs,
            confidence: map
                .get("confidence")
                .and_then(Value::as_f64)
                .map(|c| c.clamp(0.0, 1.0)),
            insights: map
                .get("insights")
                .and_then(Value::as_str)
                .map(String::from),
            usage: AiUsage::default(),
        }),
        None => Ok(AiResponse::new(Value::Object(map))),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
