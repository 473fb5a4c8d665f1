//! Per-request accounting.
//!
//! Runs on every authenticated request exit, success or failure. Metric
//! emission, request logging, and billing are independent failure domains:
//! a Store outage is logged but never changes the HTTP outcome, and the
//! request log does not participate in the billing updates.

use crate::metrics::MetricsSink;
use crate::pricing;
use crate::state::AppState;
use crate::store::{RequestLog, Store, Transaction};

use super::context::RequestContext;
use super::types::Usage;

/// What the dispatch path observed about a finished request.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub provider: Option<String>,
    pub status: u16,
    pub error_kind: Option<String>,
    pub usage: Usage,
    pub ttft_ms: Option<i64>,
    pub fallback_used: bool,
}

impl Settlement {
    pub fn failure(status: u16, error_kind: &str) -> Self {
        Self {
            provider: None,
            status,
            error_kind: Some(error_kind.to_string()),
            usage: Usage::default(),
            ttft_ms: None,
            fallback_used: false,
        }
    }
}

/// Emit metrics, append the request log, and on success bill the tenant.
/// Returns the cost charged (0 on failure or free requests).
pub fn settle(state: &AppState, ctx: &RequestContext, settlement: &Settlement) -> f64 {
    let latency_ms = ctx.started.elapsed().as_millis() as i64;
    let provider_label = settlement.provider.as_deref().unwrap_or("none");
    let status_label = settlement.status.to_string();

    state.metrics.incr_counter(
        "requests_total",
        &[("provider", provider_label), ("status", &status_label)],
    );
    state.metrics.observe_histogram(
        "latency_ms",
        &[("provider", provider_label)],
        latency_ms as f64,
    );
    if let Some(ttft) = settlement.ttft_ms {
        state
            .metrics
            .observe_histogram("ttft_ms", &[("provider", provider_label)], ttft as f64);
    }

    let success = settlement.status < 400 && settlement.error_kind.is_none();
    let tokens = settlement.usage.total_tokens;
    let cost = if success && tokens > 0 {
        pricing::cost_usd(
            tokens,
            pricing::price_for_model(state.store.as_ref(), &ctx.model),
        )
    } else {
        0.0
    };

    let now = chrono::Utc::now().timestamp();
    let log = RequestLog {
        id: 0,
        tenant_id: ctx.tenant.id.clone(),
        provider: settlement.provider.clone().unwrap_or_default(),
        model: ctx.model.clone(),
        latency_ms,
        ttft_ms: settlement.ttft_ms,
        tokens,
        cost_usd: cost,
        prompt_sha256: ctx.prompt_sha256.clone(),
        fallback_used: settlement.fallback_used,
        status: settlement.status as i64,
        error_kind: settlement.error_kind.clone(),
        created_at: now,
    };
    if let Err(err) = state.store.insert_request_log(&log) {
        tracing::error!("request log insert failed: {err}");
    }

    if success && cost > 0.0 {
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        if let Err(err) = state.store.add_usage_day(
            &ctx.tenant.id,
            provider_label,
            &ctx.model,
            &day,
            tokens,
            cost,
        ) {
            tracing::error!("usage roll-up failed: {err}");
        }
        match state.store.debit_balance(&ctx.tenant.id, cost) {
            Ok(balance_after) => {
                let tx = Transaction {
                    id: 0,
                    tenant_id: ctx.tenant.id.clone(),
                    kind: "charge".to_string(),
                    amount_usd: -cost,
                    balance_after,
                    description: format!("{} x{} tokens via {}", ctx.model, tokens, provider_label),
                    created_at: now,
                };
                if let Err(err) = state.store.append_transaction(&tx) {
                    tracing::error!("charge transaction append failed: {err}");
                }
            }
            Err(err) => tracing::error!("balance debit failed: {err}"),
        }
    }

    if let Err(err) = state.store.touch_last_active(&ctx.tenant.id) {
        tracing::warn!("last_active update failed: {err}");
    }

    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::Settings;
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
        store.upsert_model_price("gpt-4o-mini", 0.0015).unwrap();
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

    #[test]
    fn success_charges_exactly_once() {
        let (state, ctx) = fixture();
        let cost = settle(
            &state,
            &ctx,
            &Settlement {
                provider: Some("openai".into()),
                status: 200,
                error_kind: None,
                usage: Usage::new(15, 10),
                ttft_ms: Some(12),
                fallback_used: false,
            },
        );
        assert!((cost - 0.0000375).abs() < 1e-12);

        let tenant = state.store.get_tenant("t1").unwrap().unwrap();
        assert!((tenant.balance - 9.9999625).abs() < 1e-9);
        assert!(tenant.last_active.is_some());

        let txs = state.store.list_transactions("t1", 10, 0).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, "charge");
        assert!((txs[0].balance_after - 9.9999625).abs() < 1e-9);
        assert!((txs[0].amount_usd + 0.0000375).abs() < 1e-12);

        let logs = state.store.recent_request_logs(Some("t1"), 10, 0).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].tokens, 25);
        assert_eq!(logs[0].provider, "openai");

        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let usage = state
            .store
            .usage_day("t1", "openai", "gpt-4o-mini", &day)
            .unwrap()
            .unwrap();
        assert_eq!(usage.tokens, 25);
    }

    #[test]
    fn failure_logs_without_charging() {
        let (state, ctx) = fixture();
        let cost = settle(&state, &ctx, &Settlement::failure(502, "upstream_failed"));
        assert_eq!(cost, 0.0);
        assert!(state.store.list_transactions("t1", 10, 0).unwrap().is_empty());
        let logs = state.store.recent_request_logs(Some("t1"), 10, 0).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].error_kind.as_deref(), Some("upstream_failed"));
        let tenant = state.store.get_tenant("t1").unwrap().unwrap();
        assert_eq!(tenant.balance, 10.0);
    }

    #[test]
    fn unpriced_model_uses_fallback_rate() {
        let (state, mut ctx) = fixture();
        ctx.model = "mystery-model".into();
        let cost = settle(
            &state,
            &ctx,
            &Settlement {
                provider: Some("p".into()),
                status: 200,
                error_kind: None,
                usage: Usage::new(500, 500),
                ttft_ms: None,
                fallback_used: true,
            },
        );
        assert!((cost - 0.002).abs() < 1e-12);
    }
}
