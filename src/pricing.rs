//! Cost computation.
//!
//! Prices are USD per 1K tokens, keyed by model id. Models missing from the
//! price table fall back to a flat rate.

use crate::store::Store;

/// Applied when a model has no price table entry.
pub const FALLBACK_PRICE_PER_1K: f64 = 0.002;

/// USD cost for a token count at a given per-1K rate.
pub fn cost_usd(tokens: i64, usd_per_1k: f64) -> f64 {
    usd_per_1k * tokens as f64 / 1000.0
}

/// Look up the per-1K price for a model, falling back to the flat rate.
pub fn price_for_model(store: &dyn Store, model: &str) -> f64 {
    store
        .model_price(model)
        .ok()
        .flatten()
        .unwrap_or(FALLBACK_PRICE_PER_1K)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_scales_per_thousand() {
        assert!((cost_usd(1000, 1.5) - 1.5).abs() < 1e-9);
        assert!((cost_usd(25, 0.0015) - 0.0000375).abs() < 1e-12);
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        assert_eq!(cost_usd(0, 3.0), 0.0);
    }
}
