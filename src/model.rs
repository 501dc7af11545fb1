//! Model seam and the default HTTP-backed client
//!
//! The coder treats the model as an opaque capability object: it can count
//! tokens, report its context window, and complete a chat transcript. The
//! default implementation speaks the OpenAI-compatible chat completions
//! dialect over reqwest. Provider retries live here, not in the coder; the
//! coder treats repeated provider failure as fatal to the turn.

use crate::chat::{Message, Role};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Rate limit retry configuration
pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const INITIAL_BACKOFF_MS: u64 = 2000;
pub(crate) const BACKOFF_MULTIPLIER: u64 = 2;
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 120;

/// API usage information from the LLM provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// Actual cost in USD as reported by the provider, when available.
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

impl Usage {
    pub fn cost(&self) -> f64 {
        self.cost.unwrap_or(0.0)
    }

    /// Fold another usage record into this one, summing tokens and costs.
    pub fn absorb(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cost = match (self.cost, other.cost) {
            (Some(a), Some(b)) => Some(a + b),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
    }
}

/// Response from the model including content and usage stats
#[derive(Debug)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<Usage>,
}

/// Callback invoked with each streamed content chunk.
pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Opaque model capability object: completion, token accounting, window size.
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;

    /// Total tokens the model accepts in one request.
    fn context_window(&self) -> usize;

    /// Token count for a rendered transcript, per the model's own tokenizer.
    fn token_count(&self, messages: &[Message]) -> usize;

    /// Complete the transcript. Streamed chunks are forwarded to `on_chunk`
    /// as they arrive; the returned response carries the assembled content.
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        on_chunk: Option<ChunkSink<'a>>,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse>> + Send + 'a>>;
}

/// Sanitize API response content for error messages to prevent credential leakage.
fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key", "apikey", "secret", "password", "credential", "bearer", "sk-",
    ];

    let truncated: String = content.chars().take(MAX_ERROR_CONTENT_LEN).collect();
    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(response details redacted - may contain sensitive data)".to_string();
        }
    }
    truncated
}

pub(crate) fn backoff_secs(retry_count: u32) -> u64 {
    let factor = BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1));
    let ms = INITIAL_BACKOFF_MS.saturating_mul(factor);
    let secs = ms / 1000;
    if secs == 0 {
        1
    } else {
        secs
    }
}

fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireContent,
}

#[derive(Deserialize)]
struct WireContent {
    /// Content can be null in some API responses (e.g. refusal or moderation)
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// OpenAI-compatible chat completions client.
pub struct HttpModelClient {
    api_url: String,
    api_key: String,
    model_id: String,
    context_window: usize,
    max_tokens: u32,
    client: reqwest::Client,
}

impl HttpModelClient {
    pub fn new(api_url: &str, api_key: &str, model_id: &str, context_window: usize) -> Self {
        Self {
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            model_id: model_id.to_string(),
            context_window,
            max_tokens: 8192,
            client: reqwest::Client::new(),
        }
    }

    async fn send_once(&self, messages: &[Message]) -> Result<LlmResponse> {
        let request = ChatRequest {
            model: self.model_id.clone(),
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: role_str(m.role),
                    content: m.content.as_text(),
                })
                .collect(),
            max_tokens: self.max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await
            .context("Failed to reach model provider")?;

        let status = response.status();
        let body = response.text().await.context("Failed to read response")?;

        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "Provider returned {}: {}",
                status,
                sanitize_api_response(&body)
            ));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .with_context(|| format!("Malformed response: {}", sanitize_api_response(&body)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Provider returned no choices"))?;

        if let Some(refusal) = choice.message.refusal {
            return Err(anyhow::anyhow!("Model refused the request: {}", refusal));
        }

        let content = choice
            .message
            .content
            .ok_or_else(|| anyhow::anyhow!("Provider returned empty content"))?;

        Ok(LlmResponse {
            content,
            usage: parsed.usage,
        })
    }
}

impl ModelClient for HttpModelClient {
    fn name(&self) -> &str {
        &self.model_id
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn token_count(&self, messages: &[Message]) -> usize {
        // Without the provider's tokenizer locally, estimate at ~4 chars per
        // token plus a small per-message envelope. Overflow checks that need
        // precision use the strict policy margin, not this estimate alone.
        messages
            .iter()
            .map(|m| m.content.as_text().chars().count() / 4 + 8)
            .sum()
    }

    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        on_chunk: Option<ChunkSink<'a>>,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse>> + Send + 'a>> {
        Box::pin(async move {
            let mut last_err = None;
            for attempt in 1..=MAX_RETRIES {
                match self.send_once(messages).await {
                    Ok(response) => {
                        if let Some(sink) = on_chunk {
                            sink(&response.content);
                        }
                        return Ok(response);
                    }
                    Err(err) => {
                        let transient = err
                            .downcast_ref::<reqwest::Error>()
                            .map(is_retryable_network_error)
                            .unwrap_or_else(|| {
                                let msg = err.to_string();
                                msg.contains("429")
                                    || msg.contains("500")
                                    || msg.contains("502")
                                    || msg.contains("503")
                            });
                        if !transient || attempt == MAX_RETRIES {
                            return Err(err);
                        }
                        tracing::warn!(attempt, "model request failed, backing off: {err:#}");
                        tokio::time::sleep(Duration::from_secs(backoff_secs(attempt))).await;
                        last_err = Some(err);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| anyhow::anyhow!("model request failed")))
        })
    }
}

/// Generate a commit message from diff text, in the original's manner: seed
/// the model with the diff (plus optional conversation context), skip the
/// call when the diff exceeds the window, and strip surrounding quotes.
pub async fn generate_commit_message(
    model: &dyn ModelClient,
    diffs: &str,
    context: Option<&str>,
) -> Option<String> {
    let mut content = String::new();
    if let Some(ctx) = context {
        content.push_str(ctx);
        content.push('\n');
    }
    content.push_str("# Diffs:\n");
    content.push_str(diffs);

    let messages = vec![
        Message::system(crate::chat::COMMIT_MESSAGE_PROMPT),
        Message::user(&content),
    ];

    if model.token_count(&messages) > model.context_window() {
        return None;
    }

    let response = match model.complete(&messages, None).await {
        Ok(r) => r,
        Err(err) => {
            tracing::warn!("commit message generation failed: {err:#}");
            return None;
        }
    };

    let mut message = response.content.trim().to_string();
    if message.len() >= 2 && message.starts_with('"') && message.ends_with('"') {
        message = message[1..message.len() - 1].trim().to_string();
    }

    if message.is_empty() {
        None
    } else {
        Some(message)
    }
}
