//! Model resolution.
//!
//! Maps a canonical request to a route: detect the capability from message
//! content, substitute a default when the model is empty, then consult the
//! catalog (model id → provider family) and, on a miss, the tenant's
//! capability routing rule.

use crate::metrics::MetricsSink;
use crate::state::AppState;
use crate::store::{Capability, ProviderFamily, RoutingRule, Store};

use super::error::{GatewayError, GatewayResult};
use super::types::{ChatRequest, MessageContent};

/// How the candidate list will be produced.
#[derive(Debug, Clone)]
pub enum RouteKind {
    /// Catalog hit: enumerate enabled instances of the family.
    Family(ProviderFamily),
    /// Catalog miss with a tenant rule: explicit primary/secondary pair.
    Rule(RoutingRule),
}

#[derive(Debug, Clone)]
pub struct Route {
    pub model: String,
    pub capability: Capability,
    pub kind: RouteKind,
}

/// A request is vision-capable work iff any content part is an `image_url`
/// with a non-empty URL.
pub fn detect_capability(request: &ChatRequest) -> Capability {
    for message in &request.messages {
        if let Some(MessageContent::Parts(parts)) = &message.content {
            for part in parts {
                if part.kind == "image_url"
                    && part.image_url.as_ref().is_some_and(|i| !i.url().is_empty())
                {
                    return Capability::Vision;
                }
            }
        }
    }
    Capability::Text
}

/// Resolve the model and route for a request. Records catalog hit/miss.
pub fn resolve(state: &AppState, tenant_id: &str, request: &ChatRequest) -> GatewayResult<Route> {
    let capability = detect_capability(request);

    let rule = state
        .store
        .routing_rule(tenant_id, capability)
        .map_err(|e| GatewayError::Internal(format!("routing rule lookup failed: {e}")))?;

    let model = if request.model.trim().is_empty() {
        rule.as_ref()
            .map(|r| r.default_model.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "default".to_string())
    } else {
        request.model.clone()
    };

    let family = state
        .store
        .catalog_family(&model)
        .map_err(|e| GatewayError::Internal(format!("catalog lookup failed: {e}")))?;

    match family {
        Some(family) => {
            state
                .metrics
                .incr_counter("catalog_lookups_total", &[("result", "hit")]);
            Ok(Route {
                model,
                capability,
                kind: RouteKind::Family(family),
            })
        }
        None => {
            state
                .metrics
                .incr_counter("catalog_lookups_total", &[("result", "miss")]);
            match rule {
                Some(rule) => Ok(Route {
                    model,
                    capability,
                    kind: RouteKind::Rule(rule),
                }),
                None => Err(GatewayError::NoCandidates(format!(
                    "no catalog entry or routing rule for model '{model}'"
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::Settings;
    use crate::metrics::PromSink;
    use crate::store::{SqliteStore, Store};
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(MemoryCache::new()),
            Arc::new(PromSink::new()),
            Settings::default(),
        )
    }

    fn request(body: serde_json::Value) -> ChatRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn text_request_is_text_capability() {
        let req = request(serde_json::json!({
            "model": "m", "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(detect_capability(&req), Capability::Text);
    }

    #[test]
    fn image_part_flips_to_vision() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": "https://x/cat.jpg"}
            ]}]
        }));
        assert_eq!(detect_capability(&req), Capability::Vision);
    }

    #[test]
    fn empty_image_url_stays_text() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": ""}
            ]}]
        }));
        assert_eq!(detect_capability(&req), Capability::Text);
    }

    #[test]
    fn catalog_hit_routes_by_family() {
        let state = state();
        state
            .store
            .upsert_catalog_entry("gpt-4o-mini", ProviderFamily::OpenAI)
            .unwrap();
        let req = request(serde_json::json!({
            "model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]
        }));
        let route = resolve(&state, "t1", &req).unwrap();
        assert!(matches!(route.kind, RouteKind::Family(ProviderFamily::OpenAI)));
        assert_eq!(route.model, "gpt-4o-mini");
    }

    #[test]
    fn catalog_miss_falls_back_to_rule() {
        let state = state();
        state
            .store
            .upsert_routing_rule(&RoutingRule {
                tenant_id: "t1".into(),
                capability: Capability::Text,
                primary_provider: "p1".into(),
                secondary_provider: Some("p2".into()),
                default_model: "house-model".into(),
            })
            .unwrap();
        let req = request(serde_json::json!({
            "model": "unknown-model", "messages": [{"role": "user", "content": "hi"}]
        }));
        let route = resolve(&state, "t1", &req).unwrap();
        assert!(matches!(route.kind, RouteKind::Rule(_)));
    }

    #[test]
    fn empty_model_takes_rule_default() {
        let state = state();
        state
            .store
            .upsert_routing_rule(&RoutingRule {
                tenant_id: "t1".into(),
                capability: Capability::Text,
                primary_provider: "p1".into(),
                secondary_provider: None,
                default_model: "house-model".into(),
            })
            .unwrap();
        let req = request(serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let route = resolve(&state, "t1", &req).unwrap();
        assert_eq!(route.model, "house-model");
    }

    #[test]
    fn no_catalog_no_rule_is_no_candidates() {
        let state = state();
        let req = request(serde_json::json!({
            "model": "ghost", "messages": [{"role": "user", "content": "hi"}]
        }));
        let err = resolve(&state, "t1", &req).unwrap_err();
        assert_eq!(err.kind(), "no_candidates");
    }
}
