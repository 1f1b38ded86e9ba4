//! TTL cache with pattern-scoped lifetimes.
//!
//! Keys are strings; values are JSON so heterogeneous lookups (channel
//! ids, environment probes, prompt flags) share one cache. Each key's
//! lifetime is resolved from a rule table of `{pattern -> ttl}` entries;
//! unmatched keys use the default. Expiry is the only eviction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::TtlRule;

/// A cached value with its write time and resolved lifetime.
#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    written_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.written_at) <= self.ttl
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently held, live or not.
    pub total: usize,
    /// Entries within their TTL.
    pub active: usize,
    /// Entries past their TTL but not yet dropped.
    pub expired: usize,
}

/// Key-value cache with per-key-class time-to-live.
///
/// Safe to call from timer callbacks: the internal lock is never held
/// while user code (a `cached` producer) runs.
pub struct TtlCache {
    entries: Mutex<HashMap<String, Entry>>,
    rules: Vec<TtlRule>,
    default_ttl: Duration,
}

impl TtlCache {
    /// Create a cache with the given TTL rules and default lifetime.
    pub fn new(rules: Vec<TtlRule>, default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            rules,
            default_ttl,
        }
    }

    /// Get a live value, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Store a value; its TTL is resolved from the rule table.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let ttl = self.resolve_ttl(&key);
        self.insert_with_ttl(key, value, ttl);
    }

    /// Store a value with an explicit TTL, bypassing the rule table.
    pub fn insert_with_ttl(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.into(),
            Entry {
                value,
                written_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Return the cached value, computing and storing it on a miss.
    ///
    /// The producer is never invoked while a live entry exists, no matter
    /// how many times this is called within the TTL window. It runs with
    /// the cache unlocked, so it may itself consult the cache.
    pub fn cached(&self, key: &str, producer: impl FnOnce() -> Value) -> Value {
        if let Some(value) = self.get(key) {
            return value;
        }

        let value = producer();
        self.set(key, value.clone());
        value
    }

    /// Drop a single entry. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key).is_some()
    }

    /// Drop all entries whose key matches the pattern.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_matching(&self, pattern: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|key, _| !pattern_matches(pattern, key));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!("Invalidated {} cache entries matching '{}'", removed, pattern);
        }
        removed
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let active = entries.values().filter(|e| e.is_live(now)).count();
        CacheStats {
            total: entries.len(),
            active,
            expired: entries.len() - active,
        }
    }

    /// Resolve the TTL for a key from the rule table.
    fn resolve_ttl(&self, key: &str) -> Duration {
        self.rules
            .iter()
            .find(|rule| pattern_matches(&rule.pattern, key))
            .map(|rule| rule.ttl)
            .unwrap_or(self.default_ttl)
    }
}

/// Match a key against a pattern with `*` wildcards.
///
/// Greedy left-to-right matching: each literal segment must appear in
/// order, anchored at the ends unless adjacent to a `*`.
fn pattern_matches(pattern: &str, key: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == key;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = key;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            // Anchored prefix.
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            // Anchored suffix.
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }

    // Pattern ended with '*' (or was all wildcards).
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn cache_with_short_ttl() -> TtlCache {
        TtlCache::new(
            vec![TtlRule::new("short.*", Duration::from_millis(20))],
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_get_set_round_trip() {
        let cache = cache_with_short_ttl();
        cache.set("env.python", json!("/usr/bin/python3"));
        assert_eq!(cache.get("env.python"), Some(json!("/usr/bin/python3")));
        assert_eq!(cache.get("env.missing"), None);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let cache = cache_with_short_ttl();
        cache.set("short.kernel", json!(7));
        assert_eq!(cache.get("short.kernel"), Some(json!(7)));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("short.kernel"), None);

        let stats = cache.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.expired, 1);
    }

    #[test]
    fn test_cached_invokes_producer_once_per_window() {
        let cache = cache_with_short_ttl();
        let calls = Cell::new(0u32);

        for _ in 0..5 {
            let value = cache.cached("env.probe", || {
                calls.set(calls.get() + 1);
                json!("probed")
            });
            assert_eq!(value, json!("probed"));
        }

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_cached_recomputes_after_expiry() {
        let cache = cache_with_short_ttl();
        let calls = Cell::new(0u32);
        let mut produce = || {
            calls.set(calls.get() + 1);
            json!(calls.get())
        };

        assert_eq!(cache.cached("short.x", &mut produce), json!(1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.cached("short.x", &mut produce), json!(2));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_invalidate_matching() {
        let cache = cache_with_short_ttl();
        cache.set("kernel.1.channel", json!(10));
        cache.set("kernel.2.channel", json!(11));
        cache.set("env.python", json!("x"));

        assert_eq!(cache.invalidate_matching("kernel.*"), 2);
        assert_eq!(cache.get("kernel.1.channel"), None);
        assert_eq!(cache.get("env.python"), Some(json!("x")));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = cache_with_short_ttl();
        cache.set("a", json!(1));
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));

        cache.set("b", json!(2));
        cache.clear();
        assert_eq!(cache.stats().total, 0);
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("kernel.*", "kernel.1.channel"));
        assert!(pattern_matches("*.channel", "kernel.1.channel"));
        assert!(pattern_matches("kernel.*.channel", "kernel.1.channel"));
        assert!(pattern_matches("exact", "exact"));
        assert!(pattern_matches("*", "anything"));

        assert!(!pattern_matches("kernel.*", "env.python"));
        assert!(!pattern_matches("exact", "exact.not"));
        assert!(!pattern_matches("kernel.*.channel", "kernel.1.marks"));
    }
}
