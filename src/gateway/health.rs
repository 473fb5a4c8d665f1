//! Provider health: circuit breaker rings and latency EWMAs.
//!
//! One state object per provider id, created lazily on first access and
//! retained for process life. The outer map takes a read-write lock only to
//! find or insert an entry; ring updates and reads serialize on the
//! per-provider mutex so in-flight requests never contend on a single hot
//! lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Outcome window size.
const WINDOW: usize = 20;
/// Minimum samples before the failure rate is evaluated.
const MIN_SAMPLES: usize = 10;
/// Failure rate at or above which the circuit opens.
const FAILURE_THRESHOLD: f64 = 0.5;
/// Default cooldown once open.
pub const COOLDOWN: Duration = Duration::from_secs(30);

const EWMA_ALPHA: f64 = 0.3;

#[derive(Default)]
struct ProviderState {
    outcomes: VecDeque<bool>,
    open_until: Option<Instant>,
    latency_ewma_ms: Option<f64>,
}

impl ProviderState {
    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

pub struct HealthRegistry {
    states: RwLock<HashMap<String, Arc<Mutex<ProviderState>>>>,
    cooldown: Duration,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::with_cooldown(COOLDOWN)
    }

    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            cooldown,
        }
    }

    fn state(&self, provider_id: &str) -> Arc<Mutex<ProviderState>> {
        if let Some(state) = self.states.read().unwrap().get(provider_id) {
            return Arc::clone(state);
        }
        let mut states = self.states.write().unwrap();
        Arc::clone(
            states
                .entry(provider_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ProviderState::default()))),
        )
    }

    /// Whether the planner may dispatch to this provider right now.
    pub fn allow(&self, provider_id: &str) -> bool {
        let state = self.state(provider_id);
        let state = state.lock().unwrap();
        match state.open_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    /// Record one adapter outcome; opens the circuit when the windowed
    /// failure rate crosses the threshold.
    pub fn record(&self, provider_id: &str, ok: bool) {
        let state = self.state(provider_id);
        let mut state = state.lock().unwrap();
        state.outcomes.push_back(ok);
        while state.outcomes.len() > WINDOW {
            state.outcomes.pop_front();
        }
        if state.outcomes.len() >= MIN_SAMPLES && state.failure_rate() >= FAILURE_THRESHOLD {
            state.open_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                provider = provider_id,
                rate = state.failure_rate(),
                "circuit opened for {:?}",
                self.cooldown
            );
        }
    }

    pub fn record_latency(&self, provider_id: &str, latency_ms: u64) {
        let state = self.state(provider_id);
        let mut state = state.lock().unwrap();
        let sample = latency_ms as f64;
        state.latency_ewma_ms = Some(match state.latency_ewma_ms {
            Some(prev) => EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * prev,
            None => sample,
        });
    }

    /// Recent latency estimate, if any sample was recorded.
    pub fn latency_ewma(&self, provider_id: &str) -> Option<f64> {
        let state = self.state(provider_id);
        let state = state.lock().unwrap();
        state.latency_ewma_ms
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_allowed() {
        let registry = HealthRegistry::new();
        assert!(registry.allow("p"));
    }

    #[test]
    fn circuit_opens_after_ten_failures() {
        let registry = HealthRegistry::new();
        for _ in 0..9 {
            registry.record("p", false);
        }
        assert!(registry.allow("p"), "below the sample floor stays closed");
        registry.record("p", false);
        assert!(!registry.allow("p"));
    }

    #[test]
    fn half_failures_open_exactly_at_threshold() {
        let registry = HealthRegistry::new();
        for i in 0..10 {
            registry.record("p", i % 2 == 0);
        }
        assert!(!registry.allow("p"));
    }

    #[test]
    fn mostly_ok_stays_closed() {
        let registry = HealthRegistry::new();
        for i in 0..20 {
            registry.record("p", i % 5 != 0);
        }
        assert!(registry.allow("p"));
    }

    #[test]
    fn cooldown_elapse_re_admits() {
        let registry = HealthRegistry::with_cooldown(Duration::from_millis(20));
        for _ in 0..10 {
            registry.record("p", false);
        }
        assert!(!registry.allow("p"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(registry.allow("p"));
        // the probe re-enters a ring still full of failures and re-opens
        registry.record("p", true);
        assert!(!registry.allow("p"));
    }

    #[test]
    fn window_is_bounded() {
        let registry = HealthRegistry::new();
        for _ in 0..30 {
            registry.record("p", true);
        }
        for _ in 0..10 {
            registry.record("p", false);
        }
        // 10 ok + 10 fail in the window: exactly at threshold
        assert!(!registry.allow("p"));
    }

    #[test]
    fn ewma_moves_toward_samples() {
        let registry = HealthRegistry::new();
        assert!(registry.latency_ewma("p").is_none());
        registry.record_latency("p", 100);
        registry.record_latency("p", 200);
        let ewma = registry.latency_ewma("p").unwrap();
        assert!(ewma > 100.0 && ewma < 200.0);
    }
}
