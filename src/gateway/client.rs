//! Upstream HTTP client construction and SSE line handling.

use std::time::Duration;

use reqwest::Client;

use super::error::{GatewayError, GatewayResult};

/// Client for non-streaming calls: 120 s end-to-end budget.
pub fn default_client() -> GatewayResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))
}

/// Client for streaming calls: connect timeout only, the caller's
/// connection is the wall clock for the body.
pub fn streaming_client() -> GatewayResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))
}

/// Extract the payload of a `data:` SSE line.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:")
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

/// Terminal sentinel check.
pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Append a network chunk and drain every complete line. Handles CRLF and
/// line breaks split across reads; Gemini emits JSON lines well past the
/// usual SSE sizes, so the buffer grows as needed.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }

    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sse_data_variants() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("data: [DONE]"), Some("[DONE]"));
        assert_eq!(parse_sse_data("event: message"), None);
        assert_eq!(parse_sse_data(": keepalive"), None);
    }

    #[test]
    fn done_sentinel() {
        assert!(is_sse_done("[DONE]"));
        assert!(is_sse_done("  [DONE]  "));
        assert!(!is_sse_done("{}"));
    }

    #[test]
    fn drain_handles_split_lines() {
        let mut buffer = Vec::new();
        assert!(drain_sse_lines(&mut buffer, b"data: {\"id\":").is_empty());
        assert_eq!(
            drain_sse_lines(&mut buffer, b"1}\n"),
            vec!["data: {\"id\":1}"]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_handles_crlf_and_multiple_lines() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: a\r\n\r\ndata: b\n");
        assert_eq!(lines, vec!["data: a", "", "data: b"]);
    }
}
