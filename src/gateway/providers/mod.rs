//! Provider adapters.
//!
//! Each adapter translates the canonical chat request into its upstream
//! wire format, issues the HTTP call, and parses the result back into the
//! canonical response. Streaming adapters open the upstream connection and
//! hand a translator to the bridge, which forwards OpenAI-shaped deltas to
//! the client while accumulating text and usage.
//!
//! When `ENABLE_REAL_CALLS` is off (the operational default), every adapter
//! returns a deterministic canned result so the whole pipeline can be
//! smoke-tested without upstream credentials.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use crate::config::Settings;
use crate::store::{ProviderFamily, ProviderInstance};

use super::context::RequestOptions;
use super::types::{estimate_tokens, ChatRequest, ChatResponse, Usage};

/// Failure of a single adapter call, classified for the failover loop.
#[derive(Debug)]
pub enum AdapterError {
    /// Connect failure, timeout, or transport interruption.
    Transport(String),
    /// Upstream 4xx: the next candidate would likely fail the same way.
    UpstreamClient(u16, String),
    /// Upstream 5xx.
    UpstreamServer(u16, String),
    /// Body did not parse into the expected shape.
    Decode(String),
}

impl AdapterError {
    /// Whether the planner should advance to the next candidate.
    pub fn retriable(&self) -> bool {
        !matches!(self, AdapterError::UpstreamClient(..))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Transport(_) => "transport_error",
            AdapterError::UpstreamClient(..) => "upstream_client_error",
            AdapterError::UpstreamServer(..) => "upstream_server_error",
            AdapterError::Decode(_) => "decode_error",
        }
    }

    /// The raw upstream payload (or transport message) for the surfaced
    /// error body.
    pub fn payload(&self) -> &str {
        match self {
            AdapterError::Transport(msg) | AdapterError::Decode(msg) => msg,
            AdapterError::UpstreamClient(_, body) | AdapterError::UpstreamServer(_, body) => body,
        }
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::Transport(msg) => write!(f, "transport error: {msg}"),
            AdapterError::UpstreamClient(status, body) => {
                write!(f, "upstream returned {status}: {body}")
            }
            AdapterError::UpstreamServer(status, body) => {
                write!(f, "upstream returned {status}: {body}")
            }
            AdapterError::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for AdapterError {}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Classify a reqwest transport failure.
pub(crate) fn transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Transport(format!("upstream timeout: {err}"))
    } else if err.is_connect() {
        AdapterError::Transport(format!("connection failed: {err}"))
    } else {
        AdapterError::Transport(err.to_string())
    }
}

/// Classify an upstream HTTP status with its raw body.
pub(crate) fn status_error(status: u16, body: String) -> AdapterError {
    if (400..500).contains(&status) {
        AdapterError::UpstreamClient(status, body)
    } else {
        AdapterError::UpstreamServer(status, body)
    }
}

/// Result of a completed non-streaming adapter call.
#[derive(Debug)]
pub struct ChatOutcome {
    pub response: ChatResponse,
    pub usage: Usage,
    pub ttft_ms: Option<i64>,
}

/// Per-provider stream translator driven by the bridge. Accumulates the
/// concatenated text and any upstream-reported usage while producing the
/// OpenAI-shaped frames to forward.
pub enum StreamTranslator {
    OpenAI(openai::OpenAIStream),
    Anthropic(anthropic::AnthropicStream),
    Gemini(gemini::GeminiStream),
}

impl StreamTranslator {
    /// Feed one upstream `data:` payload; returns frames to forward.
    pub fn on_data(&mut self, data: &str) -> Vec<String> {
        match self {
            StreamTranslator::OpenAI(s) => s.on_data(data),
            StreamTranslator::Anthropic(s) => s.on_data(data),
            StreamTranslator::Gemini(s) => s.on_data(data),
        }
    }

    /// Whether the upstream signalled a clean end of stream.
    pub fn finished(&self) -> bool {
        match self {
            StreamTranslator::OpenAI(s) => s.finished,
            StreamTranslator::Anthropic(s) => s.finished,
            StreamTranslator::Gemini(s) => s.finished,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            StreamTranslator::OpenAI(s) => &s.text,
            StreamTranslator::Anthropic(s) => &s.text,
            StreamTranslator::Gemini(s) => &s.text,
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        match self {
            StreamTranslator::OpenAI(s) => s.usage,
            StreamTranslator::Anthropic(s) => s.usage(),
            StreamTranslator::Gemini(s) => s.usage,
        }
    }
}

/// An opened streaming source the bridge will drain.
pub enum StreamSource {
    /// Canned chunks, 50 ms apart, then `[DONE]`.
    Dummy,
    Upstream {
        response: reqwest::Response,
        translator: StreamTranslator,
    },
}

/// Canned chunks emitted by streaming dummy mode.
pub const DUMMY_STREAM_CHUNKS: [&str; 3] =
    ["This is a dummy ", "streamed response ", "from RouterX."];

const DUMMY_CONTENT: &str = "This is a dummy response from RouterX.";

fn dummy_chat(model: &str) -> ChatOutcome {
    let usage = Usage::new(15, 10);
    ChatOutcome {
        response: ChatResponse::synthetic(model, DUMMY_CONTENT.to_string(), "stop", usage),
        usage,
        ttft_ms: None,
    }
}

/// Dispatch a non-streaming chat call to the right adapter.
pub async fn chat(
    settings: &Settings,
    provider: &ProviderInstance,
    request: &ChatRequest,
    options: &RequestOptions,
    model: &str,
) -> AdapterResult<ChatOutcome> {
    if !settings.enable_real_calls {
        return Ok(dummy_chat(model));
    }
    match provider.family {
        ProviderFamily::Anthropic => anthropic::chat(provider, request, options, model).await,
        ProviderFamily::Gemini => gemini::chat(provider, request, options, model).await,
        _ => openai::chat(provider, request, options, model).await,
    }
}

/// Open a streaming chat call; the returned source is drained by the
/// bridge.
pub async fn open_stream(
    settings: &Settings,
    provider: &ProviderInstance,
    request: &ChatRequest,
    options: &RequestOptions,
    model: &str,
) -> AdapterResult<StreamSource> {
    if !settings.enable_real_calls {
        return Ok(StreamSource::Dummy);
    }
    match provider.family {
        ProviderFamily::Anthropic => {
            anthropic::open_stream(provider, request, options, model).await
        }
        ProviderFamily::Gemini => gemini::open_stream(provider, request, options, model).await,
        _ => openai::open_stream(provider, request, options, model).await,
    }
}

/// Upstream key for a request: BYOK header first, then the instance key.
pub(crate) fn effective_api_key<'a>(
    provider: &'a ProviderInstance,
    options: &'a RequestOptions,
) -> Option<&'a str> {
    options
        .upstream_key
        .as_deref()
        .or(provider.api_key.as_deref())
        .filter(|k| !k.is_empty())
}

/// Fallback usage from accumulated text when the upstream reported none.
pub(crate) fn usage_or_estimate(usage: Option<Usage>, text: &str) -> Usage {
    match usage {
        Some(u) if u.total_tokens > 0 || u.prompt_tokens + u.completion_tokens > 0 => {
            u.normalized()
        }
        _ => {
            let estimated = estimate_tokens(text);
            Usage {
                prompt_tokens: 0,
                completion_tokens: estimated,
                total_tokens: estimated,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_chat_is_25_tokens() {
        let outcome = dummy_chat("gpt-4o-mini");
        assert_eq!(outcome.usage.total_tokens, 25);
        assert_eq!(outcome.response.model, "gpt-4o-mini");
        assert_eq!(
            outcome.response.choices[0].message.content.as_deref(),
            Some(DUMMY_CONTENT)
        );
    }

    #[test]
    fn client_errors_are_not_retriable() {
        assert!(!status_error(404, String::new()).retriable());
        assert!(status_error(500, String::new()).retriable());
        assert!(AdapterError::Transport("x".into()).retriable());
        assert!(AdapterError::Decode("x".into()).retriable());
    }

    #[test]
    fn usage_estimate_kicks_in_when_missing() {
        let text = "This is a dummy streamed response from RouterX.";
        let usage = usage_or_estimate(None, text);
        assert_eq!(usage.total_tokens, estimate_tokens(text));
        let reported = usage_or_estimate(Some(Usage::new(3, 4)), text);
        assert_eq!(reported.total_tokens, 7);
    }
}
