//! Candidate planning.
//!
//! Turns a resolved route into the ordered list of provider instances to
//! try. The planner only filters and orders; it never issues requests.
//!
//! Order of operations: enumerate → capability filter → `X-Provider-Only`
//! (intersect) → `X-Provider-Ignore` (subtract) → `X-Provider-Order`
//! (reorder to the head, remainder preserved) → drop open circuits →
//! optional `X-Sort` → `X-Allow-Fallbacks: false` truncation.

use crate::pricing;
use crate::state::AppState;
use crate::store::{Capability, ProviderInstance, Store};

use super::context::{RequestOptions, SortMode};
use super::error::{GatewayError, GatewayResult};
use super::resolver::{Route, RouteKind};

fn capability_ok(provider: &ProviderInstance, capability: Capability) -> bool {
    match capability {
        Capability::Text => provider.supports_text,
        Capability::Vision => provider.supports_vision,
    }
}

fn apply_header_overrides(
    mut candidates: Vec<ProviderInstance>,
    options: &RequestOptions,
) -> Vec<ProviderInstance> {
    if !options.provider_only.is_empty() {
        candidates.retain(|p| options.provider_only.iter().any(|id| id == &p.id));
    }
    if !options.provider_ignore.is_empty() {
        candidates.retain(|p| !options.provider_ignore.iter().any(|id| id == &p.id));
    }
    if !options.provider_order.is_empty() {
        let mut head = Vec::new();
        for id in &options.provider_order {
            if let Some(pos) = candidates.iter().position(|p| &p.id == id) {
                head.push(candidates.remove(pos));
            }
        }
        head.extend(candidates);
        candidates = head;
    }
    candidates
}

/// Produce the ordered trial set for a route.
pub fn plan(
    state: &AppState,
    route: &Route,
    options: &RequestOptions,
) -> GatewayResult<Vec<ProviderInstance>> {
    let mut candidates: Vec<ProviderInstance> = match &route.kind {
        RouteKind::Family(family) => state
            .store
            .providers_by_family(*family)
            .map_err(|e| GatewayError::Internal(format!("provider enumeration failed: {e}")))?,
        RouteKind::Rule(rule) => {
            let mut ids = vec![rule.primary_provider.clone()];
            if let Some(secondary) = &rule.secondary_provider {
                ids.push(secondary.clone());
            }
            let mut out = Vec::new();
            for id in ids {
                if let Some(provider) = state
                    .store
                    .get_provider(&id)
                    .map_err(|e| GatewayError::Internal(format!("provider lookup failed: {e}")))?
                {
                    out.push(provider);
                }
            }
            out
        }
    };

    candidates.retain(|p| p.enabled && capability_ok(p, route.capability));
    candidates = apply_header_overrides(candidates, options);
    candidates.retain(|p| state.health.allow(&p.id));

    match options.sort {
        Some(SortMode::Latency) => {
            candidates.sort_by(|a, b| {
                let la = state.health.latency_ewma(&a.id).unwrap_or(f64::MAX);
                let lb = state.health.latency_ewma(&b.id).unwrap_or(f64::MAX);
                la.total_cmp(&lb)
            });
        }
        Some(SortMode::Price) => {
            // price is keyed by model, not provider; the sort is stable so
            // same-priced candidates keep their relative order
            let price = pricing::price_for_model(state.store.as_ref(), &route.model);
            candidates.sort_by(|_, _| price.total_cmp(&price));
        }
        None => {}
    }

    if !options.allow_fallbacks {
        candidates.truncate(1);
    }

    if candidates.is_empty() {
        return Err(GatewayError::NoCandidates(format!(
            "no eligible provider for model '{}' ({})",
            route.model,
            route.capability.as_str()
        )));
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::Settings;
    use crate::metrics::PromSink;
    use crate::store::{ProviderFamily, RoutingRule, SqliteStore, Store};
    use std::sync::Arc;

    fn provider(id: &str, family: ProviderFamily, vision: bool) -> ProviderInstance {
        ProviderInstance {
            id: id.to_string(),
            name: id.to_string(),
            family,
            base_url: None,
            api_key: None,
            supports_text: true,
            supports_vision: vision,
            enabled: true,
        }
    }

    fn state_with(providers: &[ProviderInstance]) -> AppState {
        let store = SqliteStore::open_in_memory().unwrap();
        for p in providers {
            store.upsert_provider(p).unwrap();
        }
        AppState::new(
            Arc::new(store),
            Arc::new(MemoryCache::new()),
            Arc::new(PromSink::new()),
            Settings::default(),
        )
    }

    fn family_route(capability: Capability) -> Route {
        Route {
            model: "gpt-4o-mini".into(),
            capability,
            kind: RouteKind::Family(ProviderFamily::OpenAI),
        }
    }

    #[test]
    fn family_route_enumerates_enabled_instances() {
        let mut disabled = provider("b", ProviderFamily::OpenAI, false);
        disabled.enabled = false;
        let state = state_with(&[provider("a", ProviderFamily::OpenAI, false), disabled]);
        let plan = plan(&state, &family_route(Capability::Text), &RequestOptions::default())
            .unwrap();
        assert_eq!(plan.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn vision_excludes_text_only_providers() {
        // rule names a vision primary and a text-only secondary; only the
        // primary survives, even as a fallback
        let state = state_with(&[
            provider("v", ProviderFamily::OpenAI, true),
            provider("t", ProviderFamily::OpenAI, false),
        ]);
        let route = Route {
            model: "m".into(),
            capability: Capability::Vision,
            kind: RouteKind::Rule(RoutingRule {
                tenant_id: "t1".into(),
                capability: Capability::Vision,
                primary_provider: "v".into(),
                secondary_provider: Some("t".into()),
                default_model: "m".into(),
            }),
        };
        let plan = plan(&state, &route, &RequestOptions::default()).unwrap();
        assert_eq!(plan.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["v"]);
    }

    #[test]
    fn header_overrides_apply_in_order() {
        let state = state_with(&[
            provider("a", ProviderFamily::OpenAI, false),
            provider("b", ProviderFamily::OpenAI, false),
            provider("c", ProviderFamily::OpenAI, false),
        ]);
        let options = RequestOptions {
            provider_ignore: vec!["b".into()],
            provider_order: vec!["c".into()],
            ..RequestOptions::default()
        };
        let plan = plan(&state, &family_route(Capability::Text), &options).unwrap();
        assert_eq!(
            plan.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["c", "a"]
        );
    }

    #[test]
    fn only_intersects() {
        let state = state_with(&[
            provider("a", ProviderFamily::OpenAI, false),
            provider("b", ProviderFamily::OpenAI, false),
        ]);
        let options = RequestOptions {
            provider_only: vec!["b".into()],
            ..RequestOptions::default()
        };
        let plan = plan(&state, &family_route(Capability::Text), &options).unwrap();
        assert_eq!(plan.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn open_circuit_is_skipped() {
        let state = state_with(&[
            provider("a", ProviderFamily::OpenAI, false),
            provider("b", ProviderFamily::OpenAI, false),
        ]);
        for _ in 0..10 {
            state.health.record("a", false);
        }
        let plan = plan(&state, &family_route(Capability::Text), &RequestOptions::default())
            .unwrap();
        assert_eq!(plan.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn all_circuits_open_is_no_candidates() {
        let state = state_with(&[provider("a", ProviderFamily::OpenAI, false)]);
        for _ in 0..10 {
            state.health.record("a", false);
        }
        let err = plan(&state, &family_route(Capability::Text), &RequestOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), "no_candidates");
    }

    #[test]
    fn latency_sort_orders_ascending() {
        // enumeration order is by id ("a" first); the sort must invert it
        let state = state_with(&[
            provider("a", ProviderFamily::OpenAI, false),
            provider("b", ProviderFamily::OpenAI, false),
        ]);
        state.health.record_latency("a", 900);
        state.health.record_latency("b", 20);
        let options = RequestOptions {
            sort: Some(SortMode::Latency),
            ..RequestOptions::default()
        };
        let plan = plan(&state, &family_route(Capability::Text), &options).unwrap();
        assert_eq!(
            plan.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
    }

    #[test]
    fn disabling_fallbacks_truncates_to_one() {
        let state = state_with(&[
            provider("a", ProviderFamily::OpenAI, false),
            provider("b", ProviderFamily::OpenAI, false),
        ]);
        let options = RequestOptions {
            allow_fallbacks: false,
            ..RequestOptions::default()
        };
        let plan = plan(&state, &family_route(Capability::Text), &options).unwrap();
        assert_eq!(plan.len(), 1);
    }
}
