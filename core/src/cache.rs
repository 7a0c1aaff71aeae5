//! Key/value cache with per-entry TTL and scoped invalidation.
//!
//! Caches are injected into read paths that can tolerate stale data
//! (storefront stock badges, listing pages). Stock and price decisions inside
//! an order transaction never read from a cache.

use crate::environment::Clock;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

/// Keys that belong to an invalidation scope (for example a storefront).
pub trait Scoped {
    /// Scope type
    type Scope: PartialEq;

    /// Scope this key belongs to
    fn scope(&self) -> Self::Scope;
}

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Thread-safe TTL cache.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Scoped,
    V: Clone,
{
    /// Create a cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Fresh value for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn insert(&self, key: K, value: V) {
        let expires_at = self.clock.now() + self.ttl;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, Entry { value, expires_at });
    }

    /// Drop one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key).is_some()
    }

    /// Drop every entry in `scope`. Returns how many were removed.
    pub fn invalidate_scope(&self, scope: &K::Scope) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| key.scope() != *scope);
        before - entries.len()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct StepClock(Mutex<DateTime<Utc>>);

    impl StepClock {
        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            *now += by;
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    #[derive(PartialEq, Eq, Hash)]
    struct Key {
        shop: i64,
        item: i64,
    }

    impl Scoped for Key {
        type Scope = i64;

        fn scope(&self) -> i64 {
            self.shop
        }
    }

    fn clock() -> Arc<StepClock> {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default();
        Arc::new(StepClock(Mutex::new(start)))
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = clock();
        let cache = TtlCache::new(Duration::seconds(10), clock.clone());
        cache.insert(Key { shop: 1, item: 1 }, 5);

        assert_eq!(cache.get(&Key { shop: 1, item: 1 }), Some(5));
        clock.advance(Duration::seconds(11));
        assert_eq!(cache.get(&Key { shop: 1, item: 1 }), None);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn scope_invalidation_only_hits_that_scope() {
        let cache = TtlCache::new(Duration::minutes(5), clock());
        cache.insert(Key { shop: 1, item: 1 }, 1);
        cache.insert(Key { shop: 1, item: 2 }, 2);
        cache.insert(Key { shop: 2, item: 1 }, 3);

        assert_eq!(cache.invalidate_scope(&1), 2);
        assert_eq!(cache.get(&Key { shop: 2, item: 1 }), Some(3));
        assert!(cache.invalidate(&Key { shop: 2, item: 1 }));
        assert!(!cache.invalidate(&Key { shop: 2, item: 1 }));
    }
}
