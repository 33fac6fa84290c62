//! LLM completion client and tolerant JSON extraction.
//!
//! The agent assumes a single capability: `complete(prompt, params) -> text`.
//! [`OpenAiClient`] provides it over any OpenAI-compatible chat-completions
//! endpoint. Rate limits (HTTP 429) are retried with a fixed 5 second backoff
//! for up to 8 attempts; every other error is returned to the caller, which
//! degrades to its default behavior. Requests and responses are appended to
//! the LLM trace file with the API key redacted.

use crate::config::LlmConfig;
use crate::trace;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

/// Fixed backoff between rate-limit retries.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(5);

/// Maximum attempts when the endpoint keeps returning 429.
const MAX_RATE_LIMIT_RETRIES: u32 = 8;

/// Per-call sampling overrides.
#[derive(Debug, Clone, Copy)]
pub struct CompletionParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 400,
        }
    }
}

impl CompletionParams {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

/// The one LLM capability the agent depends on.
#[async_trait]
pub trait Llm: Send + Sync {
    async fn complete(&self, prompt: &str, params: CompletionParams) -> anyhow::Result<String>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout.max(1)))
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Llm for OpenAiClient {
    async fn complete(&self, prompt: &str, params: CompletionParams) -> anyhow::Result<String> {
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });
        trace::llm_log("REQUEST", &body);

        let mut attempt: u32 = 0;
        loop {
            let resp = self
                .http
                .post(self.endpoint())
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(resp) if resp.status().as_u16() == 429 => {
                    attempt += 1;
                    if attempt > MAX_RATE_LIMIT_RETRIES {
                        trace::llm_log("ERROR", &json!({"type": "rate_limit", "attempts": attempt}));
                        anyhow::bail!("rate limit: retries exhausted after {attempt} attempts");
                    }
                    tracing::warn!(attempt, "rate limited (429), backing off");
                    tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let payload: Value = resp.json().await.unwrap_or(Value::Null);
                    if !status.is_success() {
                        trace::llm_log(
                            "ERROR",
                            &json!({"type": "http", "status": status.as_u16(), "body": payload}),
                        );
                        anyhow::bail!("llm request failed with status {status}");
                    }
                    let text = payload["choices"][0]["message"]["content"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    trace::llm_log(
                        "RESPONSE",
                        &json!({"model": self.config.model, "content": text}),
                    );
                    return Ok(text);
                }
                Err(e) => {
                    trace::llm_log("ERROR", &json!({"type": "transport", "message": e.to_string()}));
                    return Err(e.into());
                }
            }
        }
    }
}

/// Extract a JSON object from free-form model output.
///
/// Recognizers, in order:
/// 1. direct parse of the whole (trimmed) text;
/// 2. the first fenced ``` / ```json block;
/// 3. the span from the first `{` to the last `}`.
///
/// Returns `None` if no recognizer yields a JSON object.
pub fn parse_loose_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    if let Some(inner) = fenced_block(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(inner.trim()) {
            if v.is_object() {
                return Some(v);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
            if v.is_object() {
                return Some(v);
            }
        }
    }
    None
}

/// Return the contents of the first fenced code block, if any.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    // Skip the optional language tag on the fence line.
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}
