//! Stale-tolerant, single-flight read-through cache.
//!
//! A value is authoritative while its `enable` marker lives (`ttl`). The value
//! itself is kept for `ttl × loosing_window_rate`; in between, readers are
//! served the stale value while exactly one of them recomputes it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod mem;

pub use mem::MemCache;

use std::future::Future;
use std::time::Duration;

use tracing::{debug, trace, warn};

/// Configuration for the `LoosingCache`.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Multiplier applied to the logical TTL to get the physical lifetime of a
    /// value.
    pub loosing_window_rate: f64,

    /// Lifetime of the refresh micro-lock.
    pub acquire_lock_ttl: Duration,

    /// Waits between re-reads when a value is expected but not yet present.
    pub poll_schedule: Vec<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            loosing_window_rate: 2.0,
            acquire_lock_ttl: Duration::from_secs(1),
            poll_schedule: [50, 100, 200, 400]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

fn enable_key(key: &str) -> String {
    format!("enable:{key}")
}

fn acquire_key(key: &str) -> String {
    format!("acquire:{key}")
}

/// A loosing cache over values of type `V`.
///
/// Clones share the same entries and markers.
#[derive(Clone, Debug)]
pub struct LoosingCache<V> {
    values: MemCache<V>,
    markers: MemCache<()>,
    config: CacheConfig,
}

impl<V: Clone + Send + Sync> Default for LoosingCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<V: Clone + Send + Sync> LoosingCache<V> {
    /// Creates an empty cache.
    ///
    /// A loosing window rate that is not a finite number of at least 1 is
    /// replaced by 1.
    #[must_use]
    pub fn new(mut config: CacheConfig) -> Self {
        let rate = config.loosing_window_rate;
        if !rate.is_finite() || rate < 1.0 {
            warn!(rate, "invalid loosing window rate, using 1");
            config.loosing_window_rate = 1.0;
        }

        Self {
            values: MemCache::new(),
            markers: MemCache::new(),
            config,
        }
    }

    /// Returns the cached value for `key`, recomputing it with `fetch` when its
    /// authoritative window has passed.
    ///
    /// At most one caller per key recomputes at a time; the others are served
    /// the cached (possibly stale) value. If no value is cached yet they poll
    /// for it briefly and then call `fetch` themselves, so a fetch slower than
    /// the poll schedule can run more than once. A fetch returning `None`
    /// leaves the cache untouched.
    ///
    /// # Errors
    ///
    /// Returns whatever error `fetch` returns.
    pub async fn get_or_refresh<F, Fut, E>(
        &self,
        key: &str,
        fetch: F,
        ttl: Duration,
    ) -> Result<Option<V>, E>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let acquire = acquire_key(key);

        if self.markers.contains(&enable_key(key))
            || !self.markers.lock(&acquire, self.config.acquire_lock_ttl)
        {
            return self.serve_cached(key, fetch).await;
        }

        debug!(key, "refreshing cache entry");
        let result = fetch(key.to_string()).await;
        if let Ok(Some(value)) = &result {
            self.prime(key, value.clone(), ttl);
        }
        self.markers.unlock(&acquire);

        result
    }

    async fn serve_cached<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Option<V>, E>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(value) = self.values.get(key) {
            return Ok(Some(value));
        }

        for wait in &self.config.poll_schedule {
            tokio::time::sleep(*wait).await;
            if let Some(value) = self.values.get(key) {
                trace!(key, "cache entry appeared while polling");
                return Ok(Some(value));
            }
        }

        debug!(key, "cache entry still absent after polling, fetching directly");
        fetch(key.to_string()).await
    }

    /// Reads the cached value without any refresh logic.
    pub fn get(&self, key: &str) -> Option<V> {
        self.values.get(key)
    }

    /// Stores `value` as authoritative for `ttl`, kept as stale for the rest of
    /// the loosing window.
    pub fn prime(&self, key: &str, value: V, ttl: Duration) {
        let window =
            Duration::try_from_secs_f64(ttl.as_secs_f64() * self.config.loosing_window_rate)
                .unwrap_or(Duration::MAX);
        self.values.set(key, value, Some(window));
        self.markers.set(&enable_key(key), (), Some(ttl));
    }

    /// Ends the authoritative window of `key` while keeping its value
    /// available as stale.
    pub fn mark_stale(&self, key: &str) {
        self.markers.del(&enable_key(key));
    }

    /// Drops `key` and its markers entirely.
    pub fn invalidate(&self, key: &str) {
        self.values.del(key);
        self.markers.del(&enable_key(key));
        self.markers.del(&acquire_key(key));
    }
}
