//! Read-through response cache for the upstream client (§4.4).
//!
//! LRU eviction by capacity, plus a per-entry TTL. No `lru`/`moka` crate
//! appears anywhere in the retrieval pack, so this is hand-rolled the way
//! the teacher hand-rolls its sliding-window rate limiter.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;

struct Entry {
    value: Value,
    expires_at: Instant,
}

struct Inner {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, Entry>,
    /// Most-recently-used key is at the back.
    recency: Vec<String>,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            let k = self.recency.remove(pos);
            self.recency.push(k);
        }
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() > self.capacity {
            if self.recency.is_empty() {
                break;
            }
            let oldest = self.recency.remove(0);
            self.entries.remove(&oldest);
        }
    }
}

/// Key = method+path+stable-serialized-params, built by the caller.
pub struct ResponseCache {
    inner: Mutex<Inner>,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: capacity.max(1),
                ttl,
                entries: HashMap::new(),
                recency: Vec::new(),
            }),
        }
    }

    /// Returns the cached value if present and not expired.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let hit = match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => None,
            None => None,
        };
        if hit.is_some() {
            inner.touch(key);
        } else {
            inner.entries.remove(key);
        }
        hit
    }

    /// Insert or refresh an entry. Only called on 2xx responses by the caller.
    pub async fn put(&self, key: String, value: Value) {
        let mut inner = self.inner.lock().await;
        let ttl = inner.ttl;
        let expires_at = Instant::now() + ttl;
        if !inner.entries.contains_key(&key) {
            inner.recency.push(key.clone());
        }
        inner.entries.insert(key.clone(), Entry { value, expires_at });
        inner.touch(&key);
        inner.evict_if_needed();
    }

    /// Invalidate every key containing `substring` (e.g. a session id).
    pub async fn invalidate_containing(&self, substring: &str) {
        let mut inner = self.inner.lock().await;
        let dead: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.contains(substring))
            .cloned()
            .collect();
        for key in dead {
            inner.entries.remove(&key);
            if let Some(pos) = inner.recency.iter().position(|k| k == &key) {
                inner.recency.remove(pos);
            }
        }
    }

    /// Drop every entry whose TTL has already elapsed. Called by the
    /// scheduler's cache-expiry timer so a cache that goes cold doesn't sit
    /// on stale entries until the next `get` happens to touch each key.
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let dead: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &dead {
            inner.entries.remove(key);
            if let Some(pos) = inner.recency.iter().position(|k| k == key) {
                inner.recency.remove(pos);
            }
        }
        dead.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Build a stable cache key from an HTTP method, path, and a params value.
/// `serde_json::Value`'s `Display` impl on a `BTreeMap`-free object is not
/// guaranteed stable across serde_json versions for arbitrary maps, so the
/// caller should pass already-sorted params (see `upstream::stable_params_key`).
pub fn cache_key(method: &str, path: &str, params_repr: &str) -> String {
    format!("{method}:{path}:{params_repr}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn hit_within_ttl_miss_after() {
        let cache = ResponseCache::new(10, Duration::from_millis(30));
        cache.put("k".to_string(), json!({"a": 1})).await;
        assert_eq!(cache.get("k").await, Some(json!({"a": 1})));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn evicts_least_recently_used_over_capacity() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.put("a".to_string(), json!(1)).await;
        cache.put("b".to_string(), json!(2)).await;
        // Touch "a" so "b" becomes the least recently used.
        let _ = cache.get("a").await;
        cache.put("c".to_string(), json!(3)).await;
        assert_eq!(cache.get("b").await, None);
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn purge_expired_drops_only_stale_entries() {
        let cache = ResponseCache::new(10, Duration::from_millis(20));
        cache.put("stale".to_string(), json!(1)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.put("fresh".to_string(), json!(2)).await;
        let purged = cache.purge_expired().await;
        assert_eq!(purged, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn invalidate_by_substring() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        cache.put("get:/sessions/abc123".to_string(), json!(1)).await;
        cache.put("get:/sessions/other".to_string(), json!(2)).await;
        cache.invalidate_containing("abc123").await;
        assert_eq!(cache.get("get:/sessions/abc123").await, None);
        assert!(cache.get("get:/sessions/other").await.is_some());
    }
}
