//! Anthropic adapter.
//!
//! Translates the canonical (OpenAI-shaped) request into the Messages API
//! and back:
//! - `system` messages collapse into the single `system` string
//! - assistant `tool_calls` become `tool_use` content blocks, `tool` role
//!   messages become `user` messages carrying a `tool_result` block
//! - `tools` rename `function.parameters` to `input_schema`; `tool_choice`
//!   maps `"auto"` → `{type:"auto"}`, `"required"` → `{type:"any"}`, the
//!   object form → `{type:"tool",name}`, and `"none"` omits tools entirely
//! - `max_tokens` is mandatory upstream, defaulted to 4096
//!
//! Streaming re-encodes `content_block_delta` events as OpenAI-shaped
//! deltas; `message_delta` carries usage and `message_stop` ends the
//! stream.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::gateway::client;
use crate::gateway::context::RequestOptions;
use crate::gateway::types::{ChatRequest, ChatResponse, Choice, MessageContent, ResponseMessage, Usage};
use crate::store::ProviderInstance;

use super::{
    effective_api_key, status_error, transport_error, AdapterError, AdapterResult, ChatOutcome,
    StreamSource, StreamTranslator,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

fn base_url(provider: &ProviderInstance) -> String {
    provider
        .base_url
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or("https://api.anthropic.com")
        .trim_end_matches('/')
        .to_string()
}

fn build_headers(provider: &ProviderInstance, options: &RequestOptions) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert(
        "anthropic-version",
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );
    if let Some(key) = effective_api_key(provider, options) {
        if let Ok(value) = HeaderValue::from_str(key) {
            headers.insert("x-api-key", value);
        }
    }
    headers
}

/// `data:` URLs become base64 sources, everything else a URL source.
fn image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return serde_json::json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data}
            });
        }
    }
    serde_json::json!({
        "type": "image",
        "source": {"type": "url", "url": url}
    })
}

fn content_blocks(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![serde_json::json!({"type": "text", "text": text})]
            }
        }
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part.kind.as_str() {
                "text" => part
                    .text
                    .as_deref()
                    .map(|t| serde_json::json!({"type": "text", "text": t})),
                "image_url" => part.image_url.as_ref().map(|i| image_block(i.url())),
                _ => None,
            })
            .collect(),
    }
}

fn tool_use_blocks(tool_calls: &Value) -> Vec<Value> {
    let Some(calls) = tool_calls.as_array() else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|call| {
            let id = call.get("id").and_then(|v| v.as_str()).unwrap_or("tool_call");
            let function = call.get("function")?;
            let name = function.get("name").and_then(|v| v.as_str())?;
            let input = function
                .get("arguments")
                .and_then(|v| v.as_str())
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .unwrap_or_else(|| serde_json::json!({}));
            Some(serde_json::json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input
            }))
        })
        .collect()
}

fn map_tools(tools: &Value) -> Option<Value> {
    let list = tools.as_array()?;
    let mapped: Vec<Value> = list
        .iter()
        .filter_map(|tool| {
            let function = tool.get("function")?;
            let name = function.get("name").and_then(|v| v.as_str())?;
            let mut out = serde_json::Map::new();
            out.insert("name".to_string(), Value::String(name.to_string()));
            if let Some(description) = function.get("description") {
                out.insert("description".to_string(), description.clone());
            }
            out.insert(
                "input_schema".to_string(),
                function
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            );
            Some(Value::Object(out))
        })
        .collect();
    if mapped.is_empty() {
        None
    } else {
        Some(Value::Array(mapped))
    }
}

fn map_tool_choice(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(s) => match s.as_str() {
            "auto" => Some(serde_json::json!({"type": "auto"})),
            "required" => Some(serde_json::json!({"type": "any"})),
            _ => None,
        },
        Value::Object(_) => choice
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .map(|name| serde_json::json!({"type": "tool", "name": name})),
        _ => None,
    }
}

/// Build the Messages API body from the canonical request.
pub(crate) fn build_request(request: &ChatRequest, model: &str, stream: bool) -> Value {
    let mut out = serde_json::Map::new();
    out.insert("model".to_string(), Value::String(model.to_string()));

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" => {
                let text = message.text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "tool" => {
                let tool_use_id = message.tool_call_id.as_deref().unwrap_or("tool_call");
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": message.text()
                    }]
                }));
            }
            role => {
                let mut blocks = message
                    .content
                    .as_ref()
                    .map(content_blocks)
                    .unwrap_or_default();
                if let Some(tool_calls) = &message.tool_calls {
                    blocks.extend(tool_use_blocks(tool_calls));
                }
                if blocks.is_empty() {
                    blocks.push(serde_json::json!({"type": "text", "text": ""}));
                }
                messages.push(serde_json::json!({"role": role, "content": blocks}));
            }
        }
    }

    out.insert("messages".to_string(), Value::Array(messages));
    if !system_parts.is_empty() {
        out.insert("system".to_string(), Value::String(system_parts.join("\n\n")));
    }

    let max_tokens = request
        .max_tokens
        .or(request.max_completion_tokens)
        .unwrap_or(DEFAULT_MAX_TOKENS);
    out.insert("max_tokens".to_string(), serde_json::json!(max_tokens));

    if let Some(temperature) = request.temperature {
        out.insert("temperature".to_string(), serde_json::json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        out.insert("top_p".to_string(), serde_json::json!(top_p));
    }
    if let Some(stop) = &request.stop {
        let sequences = match stop {
            Value::String(s) => Value::Array(vec![Value::String(s.clone())]),
            other => other.clone(),
        };
        out.insert("stop_sequences".to_string(), sequences);
    }
    if stream {
        out.insert("stream".to_string(), Value::Bool(true));
    }

    let tools_disabled = request
        .tool_choice
        .as_ref()
        .and_then(|c| c.as_str())
        .is_some_and(|s| s == "none");
    if !tools_disabled {
        if let Some(mapped) = request.tools.as_ref().and_then(map_tools) {
            out.insert("tools".to_string(), mapped);
        }
        if let Some(mapped) = request.tool_choice.as_ref().and_then(map_tool_choice) {
            out.insert("tool_choice".to_string(), mapped);
        }
    }

    Value::Object(out)
}

fn usage_from(value: &Value) -> Usage {
    let usage = value.get("usage");
    let prompt = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    Usage::new(prompt, completion)
}

/// Parse a Messages API response into the canonical shape.
pub(crate) fn parse_response(value: &Value, model: &str) -> ChatResponse {
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    if let Some(blocks) = value.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "text" => {
                    if let Some(part) = block.get("text").and_then(|t| t.as_str()) {
                        text.push_str(part);
                    }
                }
                "tool_use" => {
                    let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("tool_call");
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    let arguments =
                        serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string());
                    tool_calls.push(serde_json::json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": arguments}
                    }));
                }
                _ => {}
            }
        }
    }

    let finish_reason = match value.get("stop_reason").and_then(|v| v.as_str()) {
        Some("tool_use") => "tool_calls",
        _ => "stop",
    };

    let usage = usage_from(value);
    ChatResponse {
        id: value
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(text)
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(Value::Array(tool_calls))
                },
            },
            finish_reason: Some(finish_reason.to_string()),
        }],
        usage,
    }
}

pub async fn chat(
    provider: &ProviderInstance,
    request: &ChatRequest,
    options: &RequestOptions,
    model: &str,
) -> AdapterResult<ChatOutcome> {
    let url = format!("{}/v1/messages", base_url(provider));
    let body = build_request(request, model, false);
    let http = client::default_client()
        .map_err(|e| AdapterError::Transport(e.to_string()))?;

    tracing::debug!(provider = %provider.id, %url, "anthropic chat request");

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

    let value: Value = serde_json::from_str(&text)
        .map_err(|e| AdapterError::Decode(format!("bad messages body: {e}")))?;
    let parsed = parse_response(&value, model);
    let mut usage = parsed.usage.normalized();
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
    let url = format!("{}/v1/messages", base_url(provider));
    let body = build_request(request, model, true);
    let http = client::streaming_client()
        .map_err(|e| AdapterError::Transport(e.to_string()))?;

    tracing::debug!(provider = %provider.id, %url, "anthropic stream request");

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
        translator: StreamTranslator::Anthropic(AnthropicStream::new()),
    })
}

/// Event-to-delta re-encoder for the Messages streaming protocol.
pub struct AnthropicStream {
    pub text: String,
    pub finished: bool,
    input_tokens: i64,
    output_tokens: i64,
}

impl AnthropicStream {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            finished: false,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        if self.input_tokens > 0 || self.output_tokens > 0 {
            Some(Usage::new(self.input_tokens, self.output_tokens))
        } else {
            None
        }
    }

    fn capture_usage(&mut self, usage: &Value) {
        if let Some(input) = usage.get("input_tokens").and_then(|v| v.as_i64()) {
            if input > 0 {
                self.input_tokens = input;
            }
        }
        if let Some(output) = usage.get("output_tokens").and_then(|v| v.as_i64()) {
            if output > 0 {
                self.output_tokens = output;
            }
        }
    }

    pub fn on_data(&mut self, data: &str) -> Vec<String> {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            tracing::warn!("unparseable anthropic SSE event");
            return Vec::new();
        };
        match event.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "message_start" => {
                if let Some(usage) = event.get("message").and_then(|m| m.get("usage")) {
                    self.capture_usage(usage);
                }
                Vec::new()
            }
            "content_block_delta" => {
                let Some(text) = event
                    .get("delta")
                    .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("text_delta"))
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                else {
                    return Vec::new();
                };
                self.text.push_str(text);
                vec![serde_json::json!({
                    "choices": [{"delta": {"content": text}}]
                })
                .to_string()]
            }
            "message_delta" => {
                if let Some(usage) = event.get("usage") {
                    self.capture_usage(usage);
                }
                Vec::new()
            }
            "message_stop" => {
                self.finished = true;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

impl Default for AnthropicStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: serde_json::Value) -> ChatRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn system_messages_collapse_into_system_string() {
        let req = request(serde_json::json!({
            "model": "claude-3-5-sonnet",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "system", "content": "Answer in French."},
                {"role": "user", "content": "hi"}
            ]
        }));
        let body = build_request(&req, "claude-3-5-sonnet", false);
        assert_eq!(body["system"], "Be terse.\n\nAnswer in French.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn assistant_tool_calls_become_tool_use_blocks() {
        let req = request(serde_json::json!({
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "snow"}
            ]
        }));
        let body = build_request(&req, "m", false);
        let messages = body["messages"].as_array().unwrap();
        let tool_use = &messages[1]["content"][0];
        assert_eq!(tool_use["type"], "tool_use");
        assert_eq!(tool_use["id"], "call_1");
        assert_eq!(tool_use["input"]["city"], "Oslo");
        let tool_result = &messages[2]["content"][0];
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(tool_result["type"], "tool_result");
        assert_eq!(tool_result["tool_use_id"], "call_1");
        assert_eq!(tool_result["content"], "snow");
    }

    #[test]
    fn tools_rename_parameters_to_input_schema() {
        let req = request(serde_json::json!({
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{"type": "function", "function": {
                "name": "f", "description": "d",
                "parameters": {"type": "object", "properties": {}}
            }}],
            "tool_choice": "required"
        }));
        let body = build_request(&req, "m", false);
        assert_eq!(body["tools"][0]["name"], "f");
        assert!(body["tools"][0]["input_schema"].is_object());
        assert!(body["tools"][0].get("parameters").is_none());
        assert_eq!(body["tool_choice"]["type"], "any");
    }

    #[test]
    fn tool_choice_none_omits_tools() {
        let req = request(serde_json::json!({
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{"type": "function", "function": {"name": "f", "parameters": {}}}],
            "tool_choice": "none"
        }));
        let body = build_request(&req, "m", false);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn tool_choice_object_names_the_tool() {
        let req = request(serde_json::json!({
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{"type": "function", "function": {"name": "f", "parameters": {}}}],
            "tool_choice": {"type": "function", "function": {"name": "f"}}
        }));
        let body = build_request(&req, "m", false);
        assert_eq!(body["tool_choice"]["type"], "tool");
        assert_eq!(body["tool_choice"]["name"], "f");
    }

    #[test]
    fn scalar_stop_becomes_stop_sequences() {
        let req = request(serde_json::json!({
            "messages": [{"role": "user", "content": "x"}],
            "stop": "END",
            "max_tokens": 256
        }));
        let body = build_request(&req, "m", false);
        assert_eq!(body["stop_sequences"], serde_json::json!(["END"]));
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn response_round_trips_tool_calls() {
        let upstream = serde_json::json!({
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "Checking "},
                {"type": "text", "text": "now."},
                {"type": "tool_use", "id": "call_1", "name": "get_weather",
                 "input": {"city": "Oslo"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 11, "output_tokens": 7}
        });
        let resp = parse_response(&upstream, "claude-3-5-sonnet");
        let message = &resp.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("Checking now."));
        let calls = message.tool_calls.as_ref().unwrap().as_array().unwrap();
        assert_eq!(calls[0]["id"], "call_1");
        assert_eq!(calls[0]["function"]["name"], "get_weather");
        let args: Value =
            serde_json::from_str(calls[0]["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args["city"], "Oslo");
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(resp.usage.total_tokens, 18);
    }

    #[test]
    fn stream_reencodes_text_deltas() {
        let mut stream = AnthropicStream::new();
        stream.on_data(r#"{"type":"message_start","message":{"usage":{"input_tokens":9}}}"#);
        let frames = stream.on_data(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        );
        assert_eq!(frames, vec![r#"{"choices":[{"delta":{"content":"Hi"}}]}"#.to_string()]);
        stream.on_data(r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":4}}"#);
        assert!(!stream.finished);
        stream.on_data(r#"{"type":"message_stop"}"#);
        assert!(stream.finished);
        assert_eq!(stream.text, "Hi");
        let usage = stream.usage().unwrap();
        assert_eq!(usage.prompt_tokens, 9);
        assert_eq!(usage.completion_tokens, 4);
    }

    #[test]
    fn data_urls_become_base64_image_blocks() {
        let block = image_block("data:image/png;base64,QUJD");
        assert_eq!(block["source"]["type"], "base64");
        assert_eq!(block["source"]["media_type"], "image/png");
        assert_eq!(block["source"]["data"], "QUJD");
        let url = image_block("https://x/cat.jpg");
        assert_eq!(url["source"]["type"], "url");
    }
}
