//! Request pipeline.
//!
//! The chat path is a linear composition: admission → resolution →
//! planning → adapter dispatch (circuit-guarded, with failover) → streaming
//! bridge or JSON response → accounting. Admission and planner errors are
//! terminal; adapter errors advance to the next candidate unless they are
//! upstream 4xx, the client cancelled, or fallbacks were disabled by
//! header. When every candidate is exhausted the last upstream payload is
//! surfaced under the generalized `upstream_failed` code.

pub mod accountant;
pub mod admission;
pub mod client;
pub mod context;
pub mod error;
pub mod health;
pub mod planner;
pub mod providers;
pub mod resolver;
pub mod sse;
pub mod types;

use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;

use crate::cache::Cache;
use crate::metrics::MetricsSink;
use crate::state::AppState;
use crate::store::{ProviderInstance, Store};

use accountant::Settlement;
use admission::ConcurrencyGuard;
use context::{prompt_fingerprint, RequestContext, RequestOptions};
use error::GatewayError;
use providers::AdapterError;
use types::{estimate_tokens, ChatRequest, Usage};

const HEALTH_FLAG_TTL: Duration = Duration::from_secs(30);

fn mark_provider(state: &AppState, provider_id: &str, ok: bool) {
    state.health.record(provider_id, ok);
    state.cache.set(
        &format!("provider_health:{provider_id}"),
        if ok { "ok" } else { "fail" },
        HEALTH_FLAG_TTL,
    );
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let (api_key, tenant) = match admission::authenticate(&state, &headers) {
        Ok(pair) => pair,
        Err(err) => {
            state.metrics.incr_counter(
                "requests_total",
                &[("provider", "none"), ("status", err.status().as_str())],
            );
            return err.into_response();
        }
    };

    let options = RequestOptions::from_headers(&headers);

    let mut request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            let ctx = RequestContext::new(
                tenant,
                api_key,
                String::new(),
                crate::store::Capability::Text,
                options,
                String::new(),
                started,
            );
            return reject(&state, &ctx, GatewayError::InvalidRequest(format!("bad JSON: {err}")));
        }
    };

    if request.user.is_none() {
        request.user = options.user.clone();
    }

    let fingerprint = prompt_fingerprint(&request.messages);

    let mut ctx = RequestContext::new(
        tenant,
        api_key,
        request.model.clone(),
        resolver::detect_capability(&request),
        options,
        fingerprint,
        started,
    );

    if request.messages.is_empty() {
        return reject(
            &state,
            &ctx,
            GatewayError::InvalidRequest("messages must not be empty".to_string()),
        );
    }

    // the full gate runs before any routing work; the allow-list sees the
    // requested model id, not a substituted default
    let guard = match admission::admit(&state, &ctx.tenant, &ctx.api_key, &request.model) {
        Ok(guard) => guard,
        Err(err) => return reject(&state, &ctx, err),
    };

    let route = match resolver::resolve(&state, &ctx.tenant.id, &request) {
        Ok(route) => route,
        Err(err) => return reject(&state, &ctx, err),
    };
    ctx.model = route.model.clone();

    let candidates = match planner::plan(&state, &route, &ctx.options) {
        Ok(candidates) => candidates,
        Err(err) => return reject(&state, &ctx, err),
    };

    if request.stream {
        dispatch_stream(state, ctx, &request, candidates, guard).await
    } else {
        let response = dispatch_chat(&state, &ctx, &request, candidates).await;
        // the guard is released here, after the response is built
        drop(guard);
        response
    }
}

/// Settle an admitted-but-rejected request and render the error.
fn reject(state: &AppState, ctx: &RequestContext, err: GatewayError) -> Response {
    accountant::settle(
        state,
        ctx,
        &Settlement::failure(err.status().as_u16(), err.kind()),
    );
    err.into_response()
}

async fn dispatch_chat(
    state: &AppState,
    ctx: &RequestContext,
    request: &ChatRequest,
    candidates: Vec<ProviderInstance>,
) -> Response {
    let mut last_error: Option<AdapterError> = None;

    for (attempt, provider) in candidates.into_iter().enumerate() {
        let fallback_used = attempt > 0;
        match providers::chat(&state.settings, &provider, request, &ctx.options, &ctx.model).await
        {
            Ok(outcome) => {
                mark_provider(state, &provider.id, true);
                state
                    .health
                    .record_latency(&provider.id, ctx.started.elapsed().as_millis() as u64);

                let cost = accountant::settle(
                    state,
                    ctx,
                    &Settlement {
                        provider: Some(provider.id.clone()),
                        status: 200,
                        error_kind: None,
                        usage: outcome.usage,
                        ttft_ms: outcome.ttft_ms,
                        fallback_used,
                    },
                );

                let latency_ms = ctx.started.elapsed().as_millis();
                let mut response = Json(&outcome.response).into_response();
                let headers = response.headers_mut();
                if let Ok(v) = provider.id.parse() {
                    headers.insert("x-provider", v);
                }
                if let Ok(v) = latency_ms.to_string().parse() {
                    headers.insert("x-latency-ms", v);
                }
                if let Ok(v) = cost.to_string().parse() {
                    headers.insert("x-cost-usd", v);
                }
                if let Ok(v) = (if fallback_used { "true" } else { "false" }).parse() {
                    headers.insert("x-fallback", v);
                }
                return response;
            }
            Err(err) => {
                tracing::warn!(
                    provider = %provider.id,
                    kind = err.kind(),
                    "adapter call failed: {err}"
                );
                mark_provider(state, &provider.id, false);
                let retriable = err.retriable();
                last_error = Some(err);
                if !retriable {
                    break;
                }
            }
        }
    }

    let payload = last_error
        .map(|err| err.payload().to_string())
        .unwrap_or_else(|| "no upstream available".to_string());
    reject(state, ctx, GatewayError::UpstreamFailed(payload))
}

async fn dispatch_stream(
    state: AppState,
    ctx: RequestContext,
    request: &ChatRequest,
    candidates: Vec<ProviderInstance>,
    guard: ConcurrencyGuard,
) -> Response {
    let mut last_error: Option<AdapterError> = None;

    for (attempt, provider) in candidates.into_iter().enumerate() {
        let fallback_used = attempt > 0;
        match providers::open_stream(&state.settings, &provider, request, &ctx.options, &ctx.model)
            .await
        {
            Ok(source) => {
                // once the stream is open there is no further failover; the
                // bridge records the final outcome on the circuit
                return sse::serve_stream(
                    state.clone(),
                    ctx,
                    provider.id.clone(),
                    source,
                    fallback_used,
                    guard,
                );
            }
            Err(err) => {
                tracing::warn!(
                    provider = %provider.id,
                    kind = err.kind(),
                    "stream open failed: {err}"
                );
                mark_provider(&state, &provider.id, false);
                let retriable = err.retriable();
                last_error = Some(err);
                if !retriable {
                    break;
                }
            }
        }
    }

    let payload = last_error
        .map(|err| err.payload().to_string())
        .unwrap_or_else(|| "no upstream available".to_string());
    let response = reject(&state, &ctx, GatewayError::UpstreamFailed(payload));
    drop(guard);
    response
}

/// `POST /v1/embeddings`: transparent passthrough to an OpenAI-family
/// provider for the requested model.
pub async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let (api_key, tenant) = match admission::authenticate(&state, &headers) {
        Ok(pair) => pair,
        Err(err) => {
            state.metrics.incr_counter(
                "requests_total",
                &[("provider", "none"), ("status", err.status().as_str())],
            );
            return err.into_response();
        }
    };

    let options = RequestOptions::from_headers(&headers);

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            let ctx = RequestContext::new(
                tenant,
                api_key,
                String::new(),
                crate::store::Capability::Text,
                options,
                String::new(),
                started,
            );
            return reject(&state, &ctx, GatewayError::InvalidRequest(format!("bad JSON: {err}")));
        }
    };

    let model = payload
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let ctx = RequestContext::new(
        tenant,
        api_key,
        model.clone(),
        crate::store::Capability::Text,
        options,
        String::new(),
        started,
    );

    if model.is_empty() {
        return reject(
            &state,
            &ctx,
            GatewayError::InvalidRequest("missing 'model' field".to_string()),
        );
    }

    let guard = match admission::admit(&state, &ctx.tenant, &ctx.api_key, &model) {
        Ok(guard) => guard,
        Err(err) => return reject(&state, &ctx, err),
    };

    let family = match state.store.catalog_family(&model) {
        Ok(Some(family)) if family.is_openai_compatible() => family,
        Ok(Some(_)) => {
            return reject(
                &state,
                &ctx,
                GatewayError::InvalidRequest(format!(
                    "model '{model}' is not served by an OpenAI-family provider"
                )),
            );
        }
        Ok(None) => {
            return reject(
                &state,
                &ctx,
                GatewayError::NoCandidates(format!("no catalog entry for model '{model}'")),
            );
        }
        Err(err) => {
            return reject(
                &state,
                &ctx,
                GatewayError::Internal(format!("catalog lookup failed: {err}")),
            );
        }
    };

    let route = resolver::Route {
        model: model.clone(),
        capability: crate::store::Capability::Text,
        kind: resolver::RouteKind::Family(family),
    };
    let candidates = match planner::plan(&state, &route, &ctx.options) {
        Ok(candidates) => candidates,
        Err(err) => return reject(&state, &ctx, err),
    };

    let response = dispatch_embeddings(&state, &ctx, &payload, candidates).await;
    drop(guard);
    response
}

fn embeddings_usage(value: &Value, payload: &Value) -> Usage {
    let reported = value
        .get("usage")
        .and_then(|u| u.get("total_tokens").or_else(|| u.get("prompt_tokens")))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if reported > 0 {
        Usage {
            prompt_tokens: reported,
            completion_tokens: 0,
            total_tokens: reported,
        }
    } else {
        let input = payload
            .get("input")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let estimated = estimate_tokens(&input);
        Usage {
            prompt_tokens: estimated,
            completion_tokens: 0,
            total_tokens: estimated,
        }
    }
}

fn dummy_embeddings(model: &str, payload: &Value) -> Value {
    let usage = embeddings_usage(&Value::Null, payload);
    serde_json::json!({
        "object": "list",
        "data": [{"object": "embedding", "index": 0, "embedding": vec![0.0f64; 8]}],
        "model": model,
        "usage": {"prompt_tokens": usage.prompt_tokens, "total_tokens": usage.total_tokens}
    })
}

async fn dispatch_embeddings(
    state: &AppState,
    ctx: &RequestContext,
    payload: &Value,
    candidates: Vec<ProviderInstance>,
) -> Response {
    if !state.settings.enable_real_calls {
        let provider = &candidates[0];
        let value = dummy_embeddings(&ctx.model, payload);
        let usage = embeddings_usage(&value, payload);
        mark_provider(state, &provider.id, true);
        accountant::settle(
            state,
            ctx,
            &Settlement {
                provider: Some(provider.id.clone()),
                status: 200,
                error_kind: None,
                usage,
                ttft_ms: None,
                fallback_used: false,
            },
        );
        return Json(value).into_response();
    }

    let mut last_error: Option<AdapterError> = None;
    for (attempt, provider) in candidates.into_iter().enumerate() {
        let fallback_used = attempt > 0;
        match providers::openai::embeddings(&provider, payload, &ctx.options, &ctx.model).await {
            Ok(value) => {
                mark_provider(state, &provider.id, true);
                let usage = embeddings_usage(&value, payload);
                accountant::settle(
                    state,
                    ctx,
                    &Settlement {
                        provider: Some(provider.id.clone()),
                        status: 200,
                        error_kind: None,
                        usage,
                        ttft_ms: None,
                        fallback_used,
                    },
                );
                return Json(value).into_response();
            }
            Err(err) => {
                tracing::warn!(
                    provider = %provider.id,
                    kind = err.kind(),
                    "embeddings call failed: {err}"
                );
                mark_provider(state, &provider.id, false);
                let retriable = err.retriable();
                last_error = Some(err);
                if !retriable {
                    break;
                }
            }
        }
    }

    let message = last_error
        .map(|err| err.payload().to_string())
        .unwrap_or_else(|| "no upstream available".to_string());
    reject(state, ctx, GatewayError::UpstreamFailed(message))
}

/// `GET /v1/models`: OpenAI-shaped listing of the catalog.
pub async fn list_models(State(state): State<AppState>) -> Response {
    match state.store.list_catalog() {
        Ok(entries) => {
            let data: Vec<Value> = entries
                .iter()
                .map(|entry| {
                    serde_json::json!({
                        "id": entry.model,
                        "object": "model",
                        "created": 1700000000,
                        "owned_by": entry.family.as_str()
                    })
                })
                .collect();
            Json(serde_json::json!({"object": "list", "data": data})).into_response()
        }
        Err(err) => GatewayError::Internal(format!("catalog listing failed: {err}")).into_response(),
    }
}
