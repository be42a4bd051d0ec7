use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Clone, Debug)]
struct Slot<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Slot<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local key/value map with per-entry expiry.
///
/// Expired entries are dropped lazily on access. Clones share the same map.
#[derive(Debug)]
pub struct MemCache<V> {
    map: Arc<Mutex<HashMap<String, Slot<V>>>>,
}

impl<V> Clone for MemCache<V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<V> Default for MemCache<V> {
    fn default() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<V: Clone> MemCache<V> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the live value under `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut map = self.map.lock();
        match map.get(key) {
            Some(slot) if slot.is_live(now) => Some(slot.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    /// Whether a live value exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Stores `value` under `key`. `None`, or a ttl too large to represent,
    /// means no expiry.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.map
            .lock()
            .insert(key.to_string(), Slot { value, expires_at });
    }

    /// Removes `key`. Returns whether a live value was removed.
    pub fn del(&self, key: &str) -> bool {
        let now = Instant::now();
        self.map
            .lock()
            .remove(key)
            .is_some_and(|slot| slot.is_live(now))
    }
}

impl MemCache<()> {
    /// Takes a process-local marker lock on `key` for `ttl`.
    ///
    /// Returns false if the marker is already held.
    pub fn lock(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut map = self.map.lock();
        if map.get(key).is_some_and(|slot| slot.is_live(now)) {
            return false;
        }
        map.insert(
            key.to_string(),
            Slot {
                value: (),
                expires_at: now.checked_add(ttl),
            },
        );
        true
    }

    /// Drops the marker lock on `key`.
    pub fn unlock(&self, key: &str) -> bool {
        self.del(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let cache = MemCache::new();
        cache.set("k", 1, Some(Duration::from_secs(1)));
        cache.set("forever", 2, None);

        tokio::time::advance(Duration::from_millis(1001)).await;

        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.get("forever"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_unlock() {
        let markers = MemCache::new();

        assert!(markers.lock("acquire:k", Duration::from_secs(1)));
        assert!(!markers.lock("acquire:k", Duration::from_secs(1)));
        assert!(markers.unlock("acquire:k"));
        assert!(markers.lock("acquire:k", Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(markers.lock("acquire:k", Duration::from_secs(1)));
    }
}
