//! Per-request context and caller-supplied routing options.

use std::time::Instant;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::store::{ApiKey, Capability, Tenant};

use super::types::ChatMessage;

/// Ordering preference from `X-Sort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    Latency,
    Price,
}

/// Routing and identity options parsed from request headers.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub sort: Option<SortMode>,
    pub provider_only: Vec<String>,
    pub provider_ignore: Vec<String>,
    pub provider_order: Vec<String>,
    pub allow_fallbacks: bool,
    pub user: Option<String>,
    pub title: Option<String>,
    /// BYOK upstream key from `X-API-Key`; replaces the instance key for
    /// every candidate of this request.
    pub upstream_key: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            sort: None,
            provider_only: Vec::new(),
            provider_ignore: Vec::new(),
            provider_order: Vec::new(),
            allow_fallbacks: true,
            user: None,
            title: None,
            upstream_key: None,
        }
    }
}

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn header_list(headers: &HeaderMap, key: &str) -> Vec<String> {
    header_value(headers, key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl RequestOptions {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let sort = match header_value(headers, "x-sort").as_deref() {
            Some("latency") => Some(SortMode::Latency),
            Some("price") => Some(SortMode::Price),
            _ => None,
        };
        let allow_fallbacks = header_value(headers, "x-allow-fallbacks")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true);
        Self {
            sort,
            provider_only: header_list(headers, "x-provider-only"),
            provider_ignore: header_list(headers, "x-provider-ignore"),
            provider_order: header_list(headers, "x-provider-order"),
            allow_fallbacks,
            user: header_value(headers, "x-user"),
            title: header_value(headers, "x-title"),
            upstream_key: header_value(headers, "x-api-key"),
        }
    }
}

/// Everything the dispatch pipeline needs about an admitted request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub tenant: Tenant,
    pub api_key: ApiKey,
    pub model: String,
    pub capability: Capability,
    pub options: RequestOptions,
    pub prompt_sha256: String,
    pub started: Instant,
}

impl RequestContext {
    pub fn new(
        tenant: Tenant,
        api_key: ApiKey,
        model: String,
        capability: Capability,
        options: RequestOptions,
        prompt_sha256: String,
        started: Instant,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            tenant,
            api_key,
            model,
            capability,
            options,
            prompt_sha256,
            started,
        }
    }
}

/// SHA-256 of the normalized prompt text; stored in the request log instead
/// of the prompt itself.
pub fn prompt_fingerprint(messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(message.role.as_bytes());
        hasher.update(b"\n");
        hasher.update(message.text().as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::MessageContent;

    fn msg(role: &str, text: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: Some(MessageContent::Text(text.to_string())),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    #[test]
    fn options_parse_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-sort", "latency".parse().unwrap());
        headers.insert("x-provider-only", "a, b".parse().unwrap());
        headers.insert("x-allow-fallbacks", "false".parse().unwrap());
        headers.insert("x-api-key", "sk-byok".parse().unwrap());
        let options = RequestOptions::from_headers(&headers);
        assert_eq!(options.sort, Some(SortMode::Latency));
        assert_eq!(options.provider_only, vec!["a", "b"]);
        assert!(!options.allow_fallbacks);
        assert_eq!(options.upstream_key.as_deref(), Some("sk-byok"));
    }

    #[test]
    fn fallbacks_default_on() {
        let options = RequestOptions::from_headers(&HeaderMap::new());
        assert!(options.allow_fallbacks);
        assert!(options.sort.is_none());
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = prompt_fingerprint(&[msg("user", "hi")]);
        let b = prompt_fingerprint(&[msg("user", "hi")]);
        let c = prompt_fingerprint(&[msg("user", "hi!")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
