//! Result cache for remote tool calls.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      ResultCache<V>                       │
//! │                                                          │
//! │  get(key) -> Option<V>         // lazy expiry            │
//! │  put(key, value, ttl)          // evicts one at capacity │
//! │  invalidate_server(server)     // on disconnect          │
//! │                                                          │
//! │  Internal: Mutex<HashMap<CacheKey, Entry<V>>>            │
//! │  Key: (server, tool, sha256(canonical_json(args)))       │
//! │  Eviction: LRU | LFU | FIFO | TTL, one storage layer     │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::config::serde_ms;

/// Which entry to discard when the cache is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently accessed.
    #[default]
    Lru,
    /// Least frequently accessed (ties: least recent).
    Lfu,
    /// Oldest insertion.
    Fifo,
    /// Soonest expiry; entries without a TTL go last.
    Ttl,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Fifo => "fifo",
            Self::Ttl => "ttl",
        };
        f.write_str(name)
    }
}

/// Configuration for the result cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Eviction policy
    pub policy: EvictionPolicy,

    /// Maximum number of entries (0 disables caching)
    pub capacity: usize,

    /// TTL applied when neither the call nor the server sets one
    #[serde(
        rename = "default_ttl_ms",
        with = "serde_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { policy: EvictionPolicy::Lru, capacity: 256, default_ttl: None }
    }
}

/// Cache key scoped to one server and tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Server name
    pub server: String,
    /// Tool name
    pub tool: String,
    /// SHA-256 hex digest of the canonical arguments
    pub fingerprint: String,
}

impl CacheKey {
    /// Build a key; argument key order does not matter.
    pub fn new(server: impl Into<String>, tool: impl Into<String>, args: &Value) -> Self {
        Self { server: server.into(), tool: tool.into(), fingerprint: fingerprint(args) }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.server, self.tool, &self.fingerprint[..12.min(self.fingerprint.len())])
    }
}

/// SHA-256 hex digest of `value` rendered as canonical JSON.
pub fn fingerprint(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit (0 when nothing was looked up).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Option<Duration>,
    access_count: u64,
    inserted_tick: u64,
    accessed_tick: u64,
}

impl<V> Entry<V> {
    fn expires_at(&self) -> Option<Instant> {
        self.ttl.map(|ttl| self.inserted_at + ttl)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}

struct Store<V> {
    entries: HashMap<CacheKey, Entry<V>>,
    tick: u64,
    stats: CacheStats,
}

impl<V> Store<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn purge_expired(&mut self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        self.stats.expirations += (before - self.entries.len()) as u64;
    }

    fn eviction_candidate(&self, policy: EvictionPolicy) -> Option<CacheKey> {
        let entries = self.entries.iter();
        let victim = match policy {
            EvictionPolicy::Lru => entries.min_by_key(|(_, e)| e.accessed_tick),
            EvictionPolicy::Lfu => entries.min_by_key(|(_, e)| (e.access_count, e.accessed_tick)),
            EvictionPolicy::Fifo => entries.min_by_key(|(_, e)| e.inserted_tick),
            EvictionPolicy::Ttl => entries.min_by_key(|(_, e)| {
                let expires_at = e.expires_at();
                (expires_at.is_none(), expires_at, e.inserted_tick)
            }),
        };
        victim.map(|(key, _)| key.clone())
    }
}

/// Bounded, thread-safe result cache.
pub struct ResultCache<V> {
    config: CacheConfig,
    store: Mutex<Store<V>>,
}

impl<V> fmt::Debug for ResultCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<V> ResultCache<V> {
    /// Create a cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: Mutex::new(Store { entries: HashMap::new(), tick: 0, stats: CacheStats::default() }),
        }
    }

    /// The cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether the cache stores anything at all.
    pub fn is_enabled(&self) -> bool {
        self.config.capacity > 0
    }

    /// Drop every entry belonging to `server`; returns how many were removed.
    pub fn invalidate_server(&self, server: &str) -> usize {
        let mut store = self.store.lock();
        let before = store.entries.len();
        store.entries.retain(|key, _| key.server != server);
        before - store.entries.len()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.store.lock().entries.clear();
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let store = self.store.lock();
        CacheStats { entries: store.entries.len(), ..store.stats }
    }
}

impl<V: Clone> ResultCache<V> {
    /// Look up a live entry.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let mut store = self.store.lock();

        let expired = match store.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                store.stats.misses += 1;
                return None;
            }
        };
        if expired {
            store.entries.remove(key);
            store.stats.expirations += 1;
            store.stats.misses += 1;
            return None;
        }

        let tick = store.next_tick();
        store.stats.hits += 1;
        let entry = store.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.accessed_tick = tick;
        Some(entry.value.clone())
    }

    /// Insert or replace an entry; `ttl` falls back to the default TTL.
    pub fn put(&self, key: CacheKey, value: V, ttl: Option<Duration>) {
        if !self.is_enabled() {
            return;
        }
        let now = Instant::now();
        let ttl = ttl.or(self.config.default_ttl);
        let mut store = self.store.lock();

        if !store.entries.contains_key(&key) && store.entries.len() >= self.config.capacity {
            store.purge_expired(now);
            while store.entries.len() >= self.config.capacity {
                let Some(victim) = store.eviction_candidate(self.config.policy) else {
                    break;
                };
                tracing::debug!(key = %victim, policy = %self.config.policy, "Evicting cached result");
                store.entries.remove(&victim);
                store.stats.evictions += 1;
            }
        }

        let tick = store.next_tick();
        store.stats.insertions += 1;
        store.entries.insert(
            key,
            Entry { value, inserted_at: now, ttl, access_count: 0, inserted_tick: tick, accessed_tick: tick },
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cache(policy: EvictionPolicy, capacity: usize) -> ResultCache<String> {
        ResultCache::new(CacheConfig { policy, capacity, default_ttl: None })
    }

    fn key(tool: &str) -> CacheKey {
        CacheKey::new("srv", tool, &json!({}))
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = json!({"repo": "x", "filters": {"state": "open", "labels": ["bug"]}});
        let b = json!({"filters": {"labels": ["bug"], "state": "open"}, "repo": "x"});
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&json!({"repo": "y"})));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_fingerprint_distinguishes_array_order() {
        assert_ne!(fingerprint(&json!([1, 2])), fingerprint(&json!([2, 1])));
    }

    #[test]
    fn test_put_get() {
        let cache = cache(EvictionPolicy::Lru, 4);
        cache.put(key("a"), "A".to_string(), None);
        assert_eq!(cache.get(&key("a")), Some("A".to_string()));
        assert_eq!(cache.get(&key("b")), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.insertions, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache = cache(EvictionPolicy::Fifo, 2);
        cache.put(key("a"), "A".to_string(), None);
        cache.put(key("b"), "B".to_string(), None);
        cache.put(key("a"), "A2".to_string(), None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("a")), Some("A2".to_string()));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_lru_evicts_least_recently_accessed() {
        let cache = cache(EvictionPolicy::Lru, 2);
        cache.put(key("a"), "A".to_string(), None);
        cache.put(key("b"), "B".to_string(), None);
        cache.get(&key("a"));
        cache.put(key("c"), "C".to_string(), None);

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn test_lfu_evicts_least_frequent() {
        let cache = cache(EvictionPolicy::Lfu, 2);
        cache.put(key("a"), "A".to_string(), None);
        cache.put(key("b"), "B".to_string(), None);
        cache.get(&key("a"));
        cache.get(&key("a"));
        cache.get(&key("b"));
        cache.put(key("c"), "C".to_string(), None);

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
    }

    #[test]
    fn test_fifo_ignores_access() {
        let cache = cache(EvictionPolicy::Fifo, 2);
        cache.put(key("a"), "A".to_string(), None);
        cache.put(key("b"), "B".to_string(), None);
        cache.get(&key("a"));
        cache.put(key("c"), "C".to_string(), None);

        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
    }

    #[test]
    fn test_ttl_policy_evicts_soonest_expiry() {
        let cache = cache(EvictionPolicy::Ttl, 3);
        cache.put(key("forever"), "F".to_string(), None);
        cache.put(key("long"), "L".to_string(), Some(Duration::from_secs(600)));
        cache.put(key("short"), "S".to_string(), Some(Duration::from_secs(60)));
        cache.put(key("new"), "N".to_string(), Some(Duration::from_secs(300)));

        assert!(cache.get(&key("short")).is_none());
        assert!(cache.get(&key("forever")).is_some());
        assert!(cache.get(&key("long")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_absent() {
        let cache = cache(EvictionPolicy::Lru, 4);
        cache.put(key("a"), "A".to_string(), Some(Duration::from_millis(100)));
        assert!(cache.get(&key("a")).is_some());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_purged_before_eviction() {
        let cache = cache(EvictionPolicy::Fifo, 2);
        cache.put(key("a"), "A".to_string(), None);
        cache.put(key("b"), "B".to_string(), Some(Duration::from_millis(10)));
        tokio::time::advance(Duration::from_millis(20)).await;
        cache.put(key("c"), "C".to_string(), None);

        assert!(cache.get(&key("a")).is_some());
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_zero_capacity_disables() {
        let cache = cache(EvictionPolicy::Lru, 0);
        assert!(!cache.is_enabled());
        cache.put(key("a"), "A".to_string(), None);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_server() {
        let cache = cache(EvictionPolicy::Lru, 8);
        cache.put(CacheKey::new("one", "t", &json!({})), "1".to_string(), None);
        cache.put(CacheKey::new("two", "t", &json!({})), "2".to_string(), None);

        assert_eq!(cache.invalidate_server("one"), 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_bookkeeping_without_clone() {
        struct Handle;

        let cache: ResultCache<Handle> = ResultCache::new(CacheConfig::default());
        assert!(cache.is_empty());
        assert_eq!(cache.invalidate_server("one"), 0);
        assert_eq!(cache.stats().entries, 0);
        assert!(format!("{:?}", cache).contains("len: 0"));
    }
}
