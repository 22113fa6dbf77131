use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// TTL for health probes and the model list.
pub const HEALTH_TTL: Duration = Duration::from_secs(30);

/// A value and when it was captured.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub captured_at: Instant,
}

/// In-memory cache with a fixed TTL. Reads past the TTL behave as misses and
/// evict the entry; a stale value is never returned.
///
/// The lock is never held across an await: callers read, drop, probe, then
/// write. Two concurrent misses may both probe; the later write wins.
pub struct TtlCache<K, V> {
    ttl: Duration,
    inner: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match guard.get(key) {
            Some(entry) if entry.captured_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.insert(
            key,
            CacheEntry {
                value,
                captured_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &K) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.remove(key);
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.clear();
    }
}
