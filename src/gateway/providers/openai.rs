//! OpenAI-family adapter.
//!
//! Covers `openai`, `deepseek`, `mistral`, and `generic-openai` instances:
//! the canonical request already is the upstream wire format, so the body is
//! serialized directly and responses stream back unchanged. Streaming turns
//! on `stream_options.include_usage` so the final chunk carries token
//! totals.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::gateway::client;
use crate::gateway::context::RequestOptions;
use crate::gateway::types::{ChatRequest, ChatResponse, Usage};
use crate::store::ProviderInstance;

use super::{
    effective_api_key, status_error, transport_error, AdapterError, AdapterResult, ChatOutcome,
    StreamSource, StreamTranslator,
};

fn base_url(provider: &ProviderInstance) -> AdapterResult<String> {
    provider
        .base_url
        .as_deref()
        .filter(|s| !s.is_empty())
        .or_else(|| provider.family.default_base_url())
        .map(|s| s.trim_end_matches('/').to_string())
        .ok_or_else(|| {
            AdapterError::UpstreamServer(
                502,
                format!("provider '{}' has no base URL configured", provider.id),
            )
        })
}

fn build_headers(provider: &ProviderInstance, options: &RequestOptions) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    if let Some(key) = effective_api_key(provider, options) {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
            headers.insert("authorization", value);
        }
    }
    headers
}

/// Serialize the canonical request for the upstream, overriding the model
/// and the stream flags.
pub(crate) fn build_body(request: &ChatRequest, model: &str, stream: bool) -> Value {
    let mut body = serde_json::to_value(request).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(model.to_string()));
        if stream {
            obj.insert("stream".to_string(), Value::Bool(true));
            obj.insert(
                "stream_options".to_string(),
                serde_json::json!({"include_usage": true}),
            );
        } else {
            obj.remove("stream");
            obj.remove("stream_options");
        }
    }
    body
}

fn extract_usage(response: &ChatResponse) -> Usage {
    response.usage.normalized()
}

pub async fn chat(
    provider: &ProviderInstance,
    request: &ChatRequest,
    options: &RequestOptions,
    model: &str,
) -> AdapterResult<ChatOutcome> {
    let url = format!("{}/v1/chat/completions", base_url(provider)?);
    let body = build_body(request, model, false);
    let http = client::default_client()
        .map_err(|e| AdapterError::Transport(e.to_string()))?;

    tracing::debug!(provider = %provider.id, %url, "openai chat request");

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
        return Err(status_error(status, text));
    }

    let parsed: ChatResponse = serde_json::from_str(&text)
        .map_err(|e| AdapterError::Decode(format!("bad chat completion body: {e}")))?;
    let mut usage = extract_usage(&parsed);
    if usage.total_tokens == 0 {
        let content: String = parsed
            .choices
            .iter()
            .filter_map(|c| c.message.content.as_deref())
            .collect();
        usage = super::usage_or_estimate(None, &content);
    }

    Ok(ChatOutcome {
        response: parsed,
        usage,
        ttft_ms: None,
    })
}

pub async fn open_stream(
    provider: &ProviderInstance,
    request: &ChatRequest,
    options: &RequestOptions,
    model: &str,
) -> AdapterResult<StreamSource> {
    let url = format!("{}/v1/chat/completions", base_url(provider)?);
    let body = build_body(request, model, true);
    let http = client::streaming_client()
        .map_err(|e| AdapterError::Transport(e.to_string()))?;

    tracing::debug!(provider = %provider.id, %url, "openai stream request");

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
        return Err(status_error(status, text));
    }

    Ok(StreamSource::Upstream {
        response,
        translator: StreamTranslator::OpenAI(OpenAIStream::new()),
    })
}

/// Transparent embeddings passthrough: the raw body is forwarded with the
/// model id rewritten, and the upstream JSON comes back untouched.
pub async fn embeddings(
    provider: &ProviderInstance,
    payload: &Value,
    options: &RequestOptions,
    model: &str,
) -> AdapterResult<Value> {
    let url = format!("{}/v1/embeddings", base_url(provider)?);
    let mut body = payload.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(model.to_string()));
    }
    let http = client::default_client()
        .map_err(|e| AdapterError::Transport(e.to_string()))?;

    tracing::debug!(provider = %provider.id, %url, "openai embeddings request");

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
        return Err(status_error(status, text));
    }
    serde_json::from_str(&text)
        .map_err(|e| AdapterError::Decode(format!("bad embeddings body: {e}")))
}

/// Pass-through translator: upstream chunks are already OpenAI-shaped, so
/// each `data:` payload is forwarded verbatim while content deltas and the
/// trailing usage object are accumulated for accounting.
pub struct OpenAIStream {
    pub text: String,
    pub usage: Option<Usage>,
    pub finished: bool,
}

impl OpenAIStream {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            usage: None,
            finished: false,
        }
    }

    pub fn on_data(&mut self, data: &str) -> Vec<String> {
        if client::is_sse_done(data) {
            self.finished = true;
            return Vec::new();
        }
        match serde_json::from_str::<Value>(data) {
            Ok(json) => {
                if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
                    if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
                        self.usage = Some(parsed.normalized());
                    }
                }
                if let Some(choices) = json.get("choices").and_then(|c| c.as_array()) {
                    for choice in choices {
                        if let Some(content) = choice
                            .get("delta")
                            .and_then(|d| d.get("content"))
                            .and_then(|c| c.as_str())
                        {
                            self.text.push_str(content);
                        }
                    }
                }
                vec![data.to_string()]
            }
            Err(err) => {
                tracing::warn!("unparseable openai SSE chunk: {err}");
                // forward anyway; the stream is a pass-through
                vec![data.to_string()]
            }
        }
    }
}

impl Default for OpenAIStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProviderFamily;

    fn request(body: serde_json::Value) -> ChatRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn body_keeps_canonical_fields_and_sets_stream_options() {
        let req = request(serde_json::json!({
            "model": "alias",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.5,
            "stop": ["x"]
        }));
        let body = build_body(&req, "gpt-4o-mini", true);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["stop"], serde_json::json!(["x"]));

        let non_stream = build_body(&req, "gpt-4o-mini", false);
        assert!(non_stream.get("stream").is_none());
        assert!(non_stream.get("stream_options").is_none());
    }

    #[test]
    fn default_bases_per_family() {
        let mut provider = ProviderInstance {
            id: "p".into(),
            name: "p".into(),
            family: ProviderFamily::DeepSeek,
            base_url: None,
            api_key: None,
            supports_text: true,
            supports_vision: false,
            enabled: true,
        };
        assert_eq!(base_url(&provider).unwrap(), "https://api.deepseek.com");
        provider.family = ProviderFamily::GenericOpenAI;
        assert!(base_url(&provider).is_err());
        provider.base_url = Some("https://llm.internal/".into());
        assert_eq!(base_url(&provider).unwrap(), "https://llm.internal");
    }

    #[test]
    fn byok_overrides_instance_key() {
        let provider = ProviderInstance {
            id: "p".into(),
            name: "p".into(),
            family: ProviderFamily::OpenAI,
            base_url: None,
            api_key: Some("sk-instance".into()),
            supports_text: true,
            supports_vision: false,
            enabled: true,
        };
        let options = RequestOptions {
            upstream_key: Some("sk-byok".into()),
            ..RequestOptions::default()
        };
        let headers = build_headers(&provider, &options);
        assert_eq!(
            headers.get("authorization").unwrap().to_str().unwrap(),
            "Bearer sk-byok"
        );
    }

    #[test]
    fn stream_translator_accumulates_and_passes_through() {
        let mut stream = OpenAIStream::new();
        let frames =
            stream.on_data(r#"{"choices":[{"delta":{"content":"hel"},"index":0}]}"#);
        assert_eq!(frames.len(), 1);
        stream.on_data(r#"{"choices":[{"delta":{"content":"lo"},"index":0}]}"#);
        stream.on_data(r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":2,"total_tokens":9}}"#);
        assert!(stream.on_data("[DONE]").is_empty());
        assert!(stream.finished);
        assert_eq!(stream.text, "hello");
        assert_eq!(stream.usage.unwrap().total_tokens, 9);
    }
}
