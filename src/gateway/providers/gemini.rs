//! Gemini adapter.
//!
//! Translates to `generateContent` / `streamGenerateContent?alt=sse`:
//! roles map `assistant` → `model` and `system` → `user` with a `System: `
//! prefix on the first text part; generation parameters move into
//! `generationConfig`. Auth goes out both as the `key` query parameter and
//! the `x-goog-api-key` header.
//!
//! Image parts are currently flattened into text parts (`"[image] <url>"`).
//! This loses the pixels; a faithful mapping would use `inline_data` /
//! `file_data` parts and should replace the flattening.
//!
//! A model name the API reports as not found is retried once with the
//! `-latest` suffix.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::gateway::client;
use crate::gateway::context::RequestOptions;
use crate::gateway::types::{estimate_tokens, ChatRequest, ChatResponse, MessageContent, Usage};
use crate::store::ProviderInstance;

use super::{
    effective_api_key, status_error, transport_error, AdapterError, AdapterResult, ChatOutcome,
    StreamSource, StreamTranslator,
};

fn base_url(provider: &ProviderInstance) -> String {
    provider
        .base_url
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or("https://generativelanguage.googleapis.com")
        .trim_end_matches('/')
        .to_string()
}

fn build_url(provider: &ProviderInstance, model: &str, stream: bool, key: Option<&str>) -> String {
    let method = if stream {
        "streamGenerateContent?alt=sse"
    } else {
        "generateContent"
    };
    let mut url = format!("{}/v1beta/models/{}:{}", base_url(provider), model, method);
    if let Some(key) = key {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str("key=");
        url.push_str(key);
    }
    url
}

fn build_headers(provider: &ProviderInstance, options: &RequestOptions) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    if let Some(key) = effective_api_key(provider, options) {
        if let Ok(value) = HeaderValue::from_str(key) {
            headers.insert("x-goog-api-key", value);
        }
    }
    headers
}

fn parts_for(content: &MessageContent, system_prefix: bool) -> Vec<Value> {
    let mut parts = Vec::new();
    match content {
        MessageContent::Text(text) => {
            let text = if system_prefix {
                format!("System: {text}")
            } else {
                text.clone()
            };
            parts.push(serde_json::json!({"text": text}));
        }
        MessageContent::Parts(list) => {
            let mut first_text = true;
            for part in list {
                match part.kind.as_str() {
                    "text" => {
                        if let Some(text) = part.text.as_deref() {
                            let text = if system_prefix && first_text {
                                format!("System: {text}")
                            } else {
                                text.to_string()
                            };
                            first_text = false;
                            parts.push(serde_json::json!({"text": text}));
                        }
                    }
                    "image_url" => {
                        if let Some(image) = &part.image_url {
                            parts.push(serde_json::json!({
                                "text": format!("[image] {}", image.url())
                            }));
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    parts
}

/// Build the `generateContent` body from the canonical request.
pub(crate) fn build_request(request: &ChatRequest) -> Value {
    let mut contents = Vec::new();
    for message in &request.messages {
        let (role, system_prefix) = match message.role.as_str() {
            "assistant" => ("model", false),
            "system" => ("user", true),
            _ => ("user", false),
        };
        let parts = message
            .content
            .as_ref()
            .map(|c| parts_for(c, system_prefix))
            .unwrap_or_default();
        if parts.is_empty() {
            continue;
        }
        contents.push(serde_json::json!({"role": role, "parts": parts}));
    }

    let mut body = serde_json::Map::new();
    body.insert("contents".to_string(), Value::Array(contents));

    let mut generation = serde_json::Map::new();
    if let Some(max_tokens) = request.max_tokens.or(request.max_completion_tokens) {
        generation.insert("maxOutputTokens".to_string(), serde_json::json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        generation.insert("temperature".to_string(), serde_json::json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation.insert("topP".to_string(), serde_json::json!(top_p));
    }
    if let Some(stop) = &request.stop {
        let sequences = match stop {
            Value::String(s) => Value::Array(vec![Value::String(s.clone())]),
            other => other.clone(),
        };
        generation.insert("stopSequences".to_string(), sequences);
    }
    if !generation.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(generation));
    }

    Value::Object(body)
}

fn candidate_text(value: &Value) -> String {
    let mut text = String::new();
    if let Some(candidates) = value.get("candidates").and_then(|c| c.as_array()) {
        for candidate in candidates {
            if let Some(parts) = candidate
                .get("content")
                .and_then(|c| c.get("parts"))
                .and_then(|p| p.as_array())
            {
                for part in parts {
                    if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
            }
        }
    }
    text
}

fn usage_from(value: &Value, text: &str) -> Usage {
    let metadata = value.get("usageMetadata");
    let prompt = metadata
        .and_then(|m| m.get("promptTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let completion = metadata
        .and_then(|m| m.get("candidatesTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let total = metadata
        .and_then(|m| m.get("totalTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if total > 0 {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        }
    } else if prompt + completion > 0 {
        Usage::new(prompt, completion)
    } else {
        let estimated = estimate_tokens(text);
        Usage {
            prompt_tokens: 0,
            completion_tokens: estimated,
            total_tokens: estimated,
        }
    }
}

/// Parse a `generateContent` response into the canonical shape.
pub(crate) fn parse_response(value: &Value, model: &str) -> ChatResponse {
    let text = candidate_text(value);
    let usage = usage_from(value, &text);
    ChatResponse::synthetic(model, text, "stop", usage)
}

fn model_not_found(status: u16, body: &str) -> bool {
    status >= 300 && body.to_ascii_lowercase().contains("not found")
}

pub async fn chat(
    provider: &ProviderInstance,
    request: &ChatRequest,
    options: &RequestOptions,
    model: &str,
) -> AdapterResult<ChatOutcome> {
    let body = build_request(request);
    let http = client::default_client()
        .map_err(|e| AdapterError::Transport(e.to_string()))?;
    let key = effective_api_key(provider, options).map(|s| s.to_string());

    let mut attempt_model = model.to_string();
    loop {
        let url = build_url(provider, &attempt_model, false, key.as_deref());
        tracing::debug!(provider = %provider.id, model = %attempt_model, "gemini chat request");

        let response = http
            .post(&url)
            .headers(build_headers(provider, options))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(transport_error)?;
        if status >= 300 {
            if model_not_found(status, &text) && !attempt_model.ends_with("-latest") {
                attempt_model = format!("{attempt_model}-latest");
                continue;
            }
            return Err(status_error(status, text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| AdapterError::Decode(format!("bad generateContent body: {e}")))?;
        let parsed = parse_response(&value, model);
        let usage = parsed.usage;
        return Ok(ChatOutcome {
            response: parsed,
            usage,
            ttft_ms: None,
        });
    }
}

pub async fn open_stream(
    provider: &ProviderInstance,
    request: &ChatRequest,
    options: &RequestOptions,
    model: &str,
) -> AdapterResult<StreamSource> {
    let body = build_request(request);
    let http = client::streaming_client()
        .map_err(|e| AdapterError::Transport(e.to_string()))?;
    let key = effective_api_key(provider, options).map(|s| s.to_string());

    let mut attempt_model = model.to_string();
    loop {
        let url = build_url(provider, &attempt_model, true, key.as_deref());
        tracing::debug!(provider = %provider.id, model = %attempt_model, "gemini stream request");

        let response = http
            .post(&url)
            .headers(build_headers(provider, options))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        if status >= 300 {
            let text = response.text().await.unwrap_or_default();
            if model_not_found(status, &text) && !attempt_model.ends_with("-latest") {
                attempt_model = format!("{attempt_model}-latest");
                continue;
            }
            return Err(status_error(status, text));
        }

        return Ok(StreamSource::Upstream {
            response,
            translator: StreamTranslator::Gemini(GeminiStream::new()),
        });
    }
}

/// Each SSE `data:` line is a full candidate delta; its text parts are
/// re-encoded as OpenAI-shaped deltas. Gemini has no `[DONE]` sentinel; the
/// bridge closes the stream on upstream EOF.
pub struct GeminiStream {
    pub text: String,
    pub usage: Option<Usage>,
    pub finished: bool,
}

impl GeminiStream {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            usage: None,
            finished: false,
        }
    }

    pub fn on_data(&mut self, data: &str) -> Vec<String> {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            tracing::warn!("unparseable gemini SSE event");
            return Vec::new();
        };

        if event.get("usageMetadata").is_some() {
            let usage = usage_from(&event, "");
            if usage.total_tokens > 0 {
                self.usage = Some(usage);
            }
        }

        let chunk = candidate_text(&event);
        if chunk.is_empty() {
            return Vec::new();
        }
        self.text.push_str(&chunk);
        vec![serde_json::json!({
            "choices": [{"delta": {"content": chunk}}]
        })
        .to_string()]
    }
}

impl Default for GeminiStream {
    fn default() -> Self {
        Self::new()
    }
}
