//! Volatile counter cache.
//!
//! Backs the per-second rate buckets, per-tenant concurrency counters, and
//! short-lived provider health flags. The port mirrors the small subset of
//! Redis the gateway needs; the in-process implementation is the default and
//! carries no durability expectation. `REDIS_URL` selects an external
//! implementation wired in by the embedding process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Atomic counter and string cache with per-key TTLs.
pub trait Cache: Send + Sync {
    /// Increment a counter, setting `ttl` when the key is created. Returns
    /// the post-increment value.
    fn incr(&self, key: &str, ttl: Duration) -> i64;
    /// Decrement a counter, never below zero. Returns the new value.
    fn decr(&self, key: &str) -> i64;
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str, ttl: Duration);
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-process `Cache` backed by a mutexed map.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn sweep(entries: &mut HashMap<String, Entry>) {
        if entries.len() > 1024 {
            entries.retain(|_, e| e.live());
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for MemoryCache {
    fn incr(&self, key: &str, ttl: Duration) -> i64 {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries);
        match entries.get_mut(key) {
            Some(entry) if entry.live() => {
                let n = entry.value.parse::<i64>().unwrap_or(0) + 1;
                entry.value = n.to_string();
                n
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                1
            }
        }
    }

    fn decr(&self, key: &str) -> i64 {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) if entry.live() => {
                let n = (entry.value.parse::<i64>().unwrap_or(0) - 1).max(0);
                entry.value = n.to_string();
                n
            }
            _ => 0,
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone())
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incr_and_decr() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("c", Duration::from_secs(5)), 1);
        assert_eq!(cache.incr("c", Duration::from_secs(5)), 2);
        assert_eq!(cache.decr("c"), 1);
        assert_eq!(cache.decr("c"), 0);
        assert_eq!(cache.decr("c"), 0);
    }

    #[test]
    fn decr_on_missing_key_is_zero() {
        let cache = MemoryCache::new();
        assert_eq!(cache.decr("nope"), 0);
    }

    #[test]
    fn entries_expire() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_millis(20));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("k"), None);
        // counter restarts with a fresh TTL after expiry
        cache.incr("n", Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.incr("n", Duration::from_millis(20)), 1);
    }
}
