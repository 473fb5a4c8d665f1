//! Streaming bridge.
//!
//! Owns the client-facing SSE connection for `stream = true` requests: it
//! drains the opened upstream source, forwards each chunk as
//! `data: <json>\n\n` (flushed per frame by the channel-backed body),
//! emits a comment heartbeat during upstream silence, and accumulates the
//! concatenated text plus any reported usage so accounting always settles
//! with a complete synthetic response.
//!
//! A failed channel send means the client went away: the upstream body is
//! dropped (cancelling the HTTP call), no further candidates are tried, and
//! the request settles as cancelled with whatever tokens were observed.
//! Upstream errors mid-stream close the connection without an error chunk;
//! the client already holds an HTTP 200.

use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::state::AppState;
use crate::cache::Cache;

use super::accountant::{self, Settlement};
use super::admission::ConcurrencyGuard;
use super::client::{drain_sse_lines, is_sse_done, parse_sse_data};
use super::context::RequestContext;
use super::providers::{usage_or_estimate, StreamSource, DUMMY_STREAM_CHUNKS};
use super::types::ChatResponse;

const HEARTBEAT: Duration = Duration::from_secs(15);
const DUMMY_CHUNK_PACING: Duration = Duration::from_millis(50);

async fn send_frame(tx: &mpsc::Sender<Bytes>, payload: &str) -> Result<(), ()> {
    tx.send(Bytes::from(format!("data: {payload}\n\n")))
        .await
        .map_err(|_| ())
}

async fn send_done(tx: &mpsc::Sender<Bytes>) -> Result<(), ()> {
    tx.send(Bytes::from_static(b"data: [DONE]\n\n"))
        .await
        .map_err(|_| ())
}

/// Build the SSE response and spawn the forwarding task. The concurrency
/// guard moves into the task so the token is held until the stream settles.
pub fn serve_stream(
    state: AppState,
    ctx: RequestContext,
    provider_id: String,
    source: StreamSource,
    fallback_used: bool,
    guard: ConcurrencyGuard,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let provider_header = provider_id.clone();

    tokio::spawn(async move {
        let _guard = guard;
        run_bridge(state, ctx, provider_id, source, fallback_used, tx).await;
    });

    let body_stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|bytes| (Ok::<Bytes, std::convert::Infallible>(bytes), rx))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-provider", provider_header)
        .header("x-fallback", if fallback_used { "true" } else { "false" })
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn run_bridge(
    state: AppState,
    ctx: RequestContext,
    provider_id: String,
    source: StreamSource,
    fallback_used: bool,
    tx: mpsc::Sender<Bytes>,
) {
    let mut cancelled = false;
    let mut upstream_failed = false;
    let mut ttft_ms: Option<i64> = None;
    let text;
    let reported_usage;

    match source {
        StreamSource::Dummy => {
            let mut accumulated = String::new();
            for chunk in DUMMY_STREAM_CHUNKS {
                tokio::time::sleep(DUMMY_CHUNK_PACING).await;
                let frame =
                    serde_json::json!({"choices": [{"delta": {"content": chunk}}]}).to_string();
                if ttft_ms.is_none() {
                    ttft_ms = Some(ctx.started.elapsed().as_millis() as i64);
                }
                if send_frame(&tx, &frame).await.is_err() {
                    cancelled = true;
                    break;
                }
                accumulated.push_str(chunk);
            }
            if !cancelled && send_done(&tx).await.is_err() {
                cancelled = true;
            }
            text = accumulated;
            reported_usage = None;
        }
        StreamSource::Upstream {
            response,
            mut translator,
        } => {
            let mut upstream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::with_capacity(1 << 20);
            let mut heartbeat =
                tokio::time::interval_at(tokio::time::Instant::now() + HEARTBEAT, HEARTBEAT);

            'outer: loop {
                tokio::select! {
                    chunk = upstream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for line in drain_sse_lines(&mut buffer, &bytes) {
                                if line.is_empty() {
                                    continue;
                                }
                                let Some(data) = parse_sse_data(&line) else {
                                    continue;
                                };
                                if is_sse_done(data) {
                                    if send_done(&tx).await.is_err() {
                                        cancelled = true;
                                    }
                                    break 'outer;
                                }
                                for frame in translator.on_data(data) {
                                    if ttft_ms.is_none() {
                                        ttft_ms =
                                            Some(ctx.started.elapsed().as_millis() as i64);
                                    }
                                    if send_frame(&tx, &frame).await.is_err() {
                                        cancelled = true;
                                        break 'outer;
                                    }
                                }
                                if translator.finished() {
                                    if send_done(&tx).await.is_err() {
                                        cancelled = true;
                                    }
                                    break 'outer;
                                }
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(
                                provider = %provider_id,
                                "upstream stream error: {err}"
                            );
                            upstream_failed = true;
                            break 'outer;
                        }
                        None => {
                            // clean upstream EOF without a sentinel (Gemini)
                            if send_done(&tx).await.is_err() {
                                cancelled = true;
                            }
                            break 'outer;
                        }
                    },
                    _ = heartbeat.tick() => {
                        if tx.send(Bytes::from_static(b": keepalive\n\n")).await.is_err() {
                            cancelled = true;
                            break 'outer;
                        }
                    }
                }
            }

            text = translator.text().to_string();
            reported_usage = translator.usage();
        }
    }

    if cancelled {
        tracing::debug!(provider = %provider_id, "client cancelled mid-stream");
    } else if upstream_failed {
        state.health.record(&provider_id, false);
        state
            .cache
            .set(&format!("provider_health:{provider_id}"), "fail", Duration::from_secs(30));
    } else {
        state.health.record(&provider_id, true);
        state
            .health
            .record_latency(&provider_id, ctx.started.elapsed().as_millis() as u64);
        state
            .cache
            .set(&format!("provider_health:{provider_id}"), "ok", Duration::from_secs(30));
    }

    let usage = usage_or_estimate(reported_usage, &text);
    let synthetic = ChatResponse::synthetic(&ctx.model, text, "stop", usage);
    let (status, error_kind) = if cancelled {
        (499u16, Some("client_cancelled".to_string()))
    } else if upstream_failed {
        (502u16, Some("upstream_failed".to_string()))
    } else {
        (200u16, None)
    };

    accountant::settle(
        &state,
        &ctx,
        &Settlement {
            provider: Some(provider_id),
            status,
            error_kind,
            usage: synthetic.usage,
            ttft_ms,
            fallback_used,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::Settings;
    use crate::gateway::admission;
    use crate::gateway::context::RequestOptions;
    use crate::metrics::PromSink;
    use crate::store::{ApiKey, Capability, SqliteStore, Store, Tenant};
    use std::sync::Arc;
    use std::time::Instant;

    fn fixture() -> (AppState, RequestContext) {
        let store = SqliteStore::open_in_memory().unwrap();
        let tenant = Tenant {
            id: "t1".into(),
            name: "t1".into(),
            balance: 10.0,
            suspended: false,
            rate_limit_rpm: 0,
            spend_limit_usd: None,
            total_topup: 10.0,
            total_spent: 0.0,
            last_active: None,
            created_at: 0,
        };
        store.create_tenant(&tenant).unwrap();
        let state = AppState::new(
            Arc::new(store),
            Arc::new(MemoryCache::new()),
            Arc::new(PromSink::new()),
            Settings::default(),
        );
        let ctx = RequestContext::new(
            tenant,
            ApiKey {
                key: "k1".into(),
                tenant_id: "t1".into(),
                name: "k1".into(),
                allowed_models: vec![],
                created_at: 0,
            },
            "gpt-4o-mini".into(),
            Capability::Text,
            RequestOptions::default(),
            "fp".into(),
            Instant::now(),
        );
        (state, ctx)
    }

    fn guard_for(state: &AppState, ctx: &RequestContext) -> ConcurrencyGuard {
        admission::admit(state, &ctx.tenant, &ctx.api_key, &ctx.model).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn dummy_bridge_emits_exact_frames() {
        let (state, ctx) = fixture();
        let guard = guard_for(&state, &ctx);
        let (tx, mut rx) = mpsc::channel::<Bytes>(32);
        {
            let _guard = guard;
            run_bridge(
                state.clone(),
                ctx,
                "openai".to_string(),
                StreamSource::Dummy,
                false,
                tx,
            )
            .await;
        }

        let mut body = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            body.extend_from_slice(&bytes);
        }
        let body = String::from_utf8(body).unwrap();
        assert_eq!(
            body,
            "data: {\"choices\":[{\"delta\":{\"content\":\"This is a dummy \"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"streamed response \"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"from RouterX.\"}}]}\n\n\
             data: [DONE]\n\n"
        );

        let logs = state.store.recent_request_logs(Some("t1"), 10, 0).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, 200);
        assert!(logs[0].tokens > 0);
        assert!(logs[0].ttft_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_receiver_settles_as_cancelled() {
        let (state, ctx) = fixture();
        let guard = guard_for(&state, &ctx);
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        drop(rx);
        {
            let _guard = guard;
            run_bridge(
                state.clone(),
                ctx,
                "openai".to_string(),
                StreamSource::Dummy,
                false,
                tx,
            )
            .await;
        }

        let logs = state.store.recent_request_logs(Some("t1"), 10, 0).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, 499);
        assert_eq!(logs[0].error_kind.as_deref(), Some("client_cancelled"));
        // no charge on a cancelled request
        assert!(state.store.list_transactions("t1", 10, 0).unwrap().is_empty());
        // the concurrency token was released with the guard
        assert_eq!(state.cache.decr("conc:t1"), 0);
    }
}
