//! Distributed mutual exclusion built on the external key-value store.
//!
//! Ownership is proven only by the value stored under the lock key: a locker
//! identity string compared by equality. There is no local handle.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use turtle_kv::{KvStore, SetCondition, SetRequest, join_key};

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, Error>;

const KEY_PREFIX: &str = "mutex";

// released locks are overwritten with this expiry instead of being deleted
const RELEASE_TTL: Duration = Duration::from_millis(1);

const SINGLE_KEY_BACKOFF_PER_WAITER: Duration = Duration::from_millis(5);
const MULTI_KEY_BACKOFF: Duration = Duration::from_millis(10);

/// Represents the current status of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is free.
    Free,

    /// The lock is held by another locker, identified by the String.
    HeldByOther(String),

    /// The lock is held by the asking locker.
    HeldBySelf,
}

/// Outcome of releasing one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// The key was held by the caller and is now released.
    Released,

    /// The key is held by someone else. Nothing was changed.
    NotOwner,

    /// The key was not held by anyone.
    Absent,
}

/// Configuration for the `DistributedLock`.
#[derive(Clone, Debug)]
pub struct LockConfig {
    /// How long an acquired lock lives if never released.
    pub ttl: Duration,

    /// Retry budget per acquisition. Negative means unlimited.
    pub retries: i64,

    /// Number of outstanding waiters per key (in this process) at which new
    /// acquisitions fail fast instead of queueing.
    pub waiter_threshold: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(5000),
            retries: -1,
            waiter_threshold: 100,
        }
    }
}

type WaiterCounts = Arc<Mutex<HashMap<String, usize>>>;

/// Decrements the waiter count of its key when dropped.
struct WaiterGuard {
    counts: WaiterCounts,
    key: String,
}

impl WaiterGuard {
    fn enter(counts: &WaiterCounts, key: &str, threshold: usize) -> Result<Self> {
        let mut map = counts.lock();
        let waiters = map.entry(key.to_string()).or_insert(0);
        if *waiters >= threshold {
            return Err(Error::ContentionExceeded {
                key: key.to_string(),
                waiters: *waiters,
            });
        }
        *waiters += 1;

        Ok(Self {
            counts: counts.clone(),
            key: key.to_string(),
        })
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut map = self.counts.lock();
        if let Some(waiters) = map.get_mut(&self.key) {
            *waiters = waiters.saturating_sub(1);
            if *waiters == 0 {
                map.remove(&self.key);
            }
        }
    }
}

/// Whether another attempt is allowed. Negative budgets never run out.
const fn take_retry(retries: &mut i64) -> bool {
    if *retries == 0 {
        return false;
    }
    if *retries > 0 {
        *retries -= 1;
    }
    true
}

fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(fastrand::u64(0..=max_ms))
}

/// A distributed lock over a `KvStore`.
///
/// Clones share the store client and the process-local waiter counters.
#[derive(Clone)]
pub struct DistributedLock<S: KvStore> {
    store: S,
    config: LockConfig,
    waiters: WaiterCounts,
}

impl<S: KvStore> DistributedLock<S> {
    /// Creates a new `DistributedLock` with the given store and configuration.
    pub fn new(store: S, config: LockConfig) -> Self {
        Self {
            store,
            config,
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the configuration in use.
    pub const fn config(&self) -> &LockConfig {
        &self.config
    }

    fn store_key(key: &str) -> String {
        join_key(&[KEY_PREFIX, key])
    }

    /// Number of callers in this process currently waiting on `key`.
    pub fn waiters(&self, key: &str) -> usize {
        self.waiters.lock().get(key).copied().unwrap_or(0)
    }

    /// Acquires `key` for `identity` using the configured TTL and retry budget.
    ///
    /// Returns `Ok(false)` when the retry budget is exhausted.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ContentionExceeded`] when too many callers of this
    /// process already wait on the key, and with [`Error::Store`] when the
    /// store is unreachable.
    pub async fn acquire(&self, key: &str, identity: &str) -> Result<bool> {
        self.acquire_with(key, identity, self.config.ttl, self.config.retries)
            .await
    }

    /// Acquires `key` for `identity` with an explicit TTL and retry budget.
    ///
    /// # Errors
    ///
    /// See [`DistributedLock::acquire`].
    #[instrument(skip(self, key, identity), fields(key = %key, identity = %identity))]
    pub async fn acquire_with(
        &self,
        key: &str,
        identity: &str,
        ttl: Duration,
        mut retries: i64,
    ) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let _waiter = WaiterGuard::enter(&self.waiters, key, self.config.waiter_threshold)?;
        let store_key = Self::store_key(key);
        let value = Bytes::copy_from_slice(identity.as_bytes());

        loop {
            if self
                .store
                .set_if_absent(&store_key, value.clone(), ttl)
                .await
                .map_err(Error::store)?
            {
                debug!("lock acquired");
                return Ok(true);
            }

            if !take_retry(&mut retries) {
                debug!("lock retries exhausted");
                return Ok(false);
            }

            let waiters = u32::try_from(self.waiters(key).max(1)).unwrap_or(u32::MAX);
            let backoff = SINGLE_KEY_BACKOFF_PER_WAITER * waiters;
            tokio::time::sleep(backoff + jitter(SINGLE_KEY_BACKOFF_PER_WAITER)).await;
        }
    }

    /// Acquires every key in `keys` for `identity`, all or nothing.
    ///
    /// Duplicate keys are collapsed. Each attempt submits all keys in one
    /// pipelined call. Keys already held from a previous attempt are refreshed
    /// with a held-by-me condition, so a later attempt cannot lose them to
    /// another locker. When the retry budget runs out or the store fails,
    /// every key held so far is released first.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::EmptyKey`] for an empty list or key, and with
    /// [`Error::Store`] when the store is unreachable.
    pub async fn acquire_many(&self, keys: &[&str], identity: &str) -> Result<bool> {
        self.acquire_many_with(keys, identity, self.config.ttl, self.config.retries)
            .await
    }

    /// Like [`DistributedLock::acquire_many`] with an explicit TTL and retry
    /// budget.
    ///
    /// # Errors
    ///
    /// See [`DistributedLock::acquire_many`].
    #[instrument(skip(self, identity), fields(identity = %identity))]
    pub async fn acquire_many_with(
        &self,
        keys: &[&str],
        identity: &str,
        ttl: Duration,
        mut retries: i64,
    ) -> Result<bool> {
        if keys.is_empty() || keys.iter().any(|key| key.is_empty()) {
            return Err(Error::EmptyKey);
        }

        let mut unique: Vec<&str> = Vec::with_capacity(keys.len());
        for key in keys {
            if !unique.contains(key) {
                unique.push(key);
            }
        }
        let keys = unique.as_slice();

        let value = Bytes::copy_from_slice(identity.as_bytes());
        let mut held = vec![false; keys.len()];

        loop {
            let requests = keys
                .iter()
                .zip(&held)
                .map(|(key, &is_held)| SetRequest {
                    key: Self::store_key(key),
                    value: value.clone(),
                    ttl,
                    condition: if is_held {
                        SetCondition::IfHeldBy(value.clone())
                    } else {
                        SetCondition::IfAbsent
                    },
                })
                .collect();

            held = match self.store.set_many(requests).await {
                Ok(held) => held,
                Err(e) => {
                    self.release_held(keys, &held, identity).await;
                    return Err(Error::store(e));
                }
            };

            if held.iter().all(|&is_held| is_held) {
                debug!(?keys, "all locks acquired");
                return Ok(true);
            }

            if !take_retry(&mut retries) {
                warn!(?keys, "lock retries exhausted, releasing partially held keys");
                self.release_held(keys, &held, identity).await;
                return Ok(false);
            }

            tokio::time::sleep(MULTI_KEY_BACKOFF + jitter(MULTI_KEY_BACKOFF)).await;
        }
    }

    async fn release_held(&self, keys: &[&str], held: &[bool], identity: &str) {
        for (key, _) in keys.iter().zip(held).filter(|(_, is_held)| **is_held) {
            if let Err(e) = self.release(key, identity).await {
                warn!(key = %key, error = %e, "failed to release partially held lock");
            }
        }
    }

    /// Releases `key` if it is held by `identity`.
    ///
    /// A mismatched identity yields [`ReleaseStatus::NotOwner`] and leaves the
    /// true holder untouched. The key is overwritten with a tiny expiry rather
    /// than deleted, in one conditional write on the stored identity.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`] when the store is unreachable.
    #[instrument(skip(self, key, identity), fields(key = %key, identity = %identity))]
    pub async fn release(&self, key: &str, identity: &str) -> Result<ReleaseStatus> {
        let store_key = Self::store_key(key);
        let value = Bytes::copy_from_slice(identity.as_bytes());

        if self
            .store
            .set_if_held(&store_key, value, RELEASE_TTL)
            .await
            .map_err(Error::store)?
        {
            debug!("lock released");
            return Ok(ReleaseStatus::Released);
        }

        match self.store.get(&store_key).await.map_err(Error::store)? {
            None => {
                debug!("lock already free");
                Ok(ReleaseStatus::Absent)
            }
            Some(current) => {
                warn!(
                    holder = %String::from_utf8_lossy(&current),
                    "locker identity does not match, lock not released"
                );
                Ok(ReleaseStatus::NotOwner)
            }
        }
    }

    /// Releases every key in `keys`, returning one status per key.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`] when the store is unreachable.
    pub async fn release_many(&self, keys: &[&str], identity: &str) -> Result<Vec<ReleaseStatus>> {
        let mut statuses = Vec::with_capacity(keys.len());
        for key in keys {
            statuses.push(self.release(key, identity).await?);
        }
        Ok(statuses)
    }

    /// Checks the status of `key` from the point of view of `identity`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`] when the store is unreachable.
    pub async fn check(&self, key: &str, identity: &str) -> Result<LockStatus> {
        let current = self
            .store
            .get(&Self::store_key(key))
            .await
            .map_err(Error::store)?;

        Ok(match current {
            None => LockStatus::Free,
            Some(value) if value == identity.as_bytes() => LockStatus::HeldBySelf,
            Some(value) => LockStatus::HeldByOther(String::from_utf8_lossy(&value).to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use turtle_kv::{CasOutcome, Versioned};
    use turtle_kv_memory::MemoryKvStore;
    use uuid::Uuid;

    /// Memory store whose conditional refreshes are slow and whose pipelined
    /// writes can run out.
    #[derive(Clone, Default)]
    struct ScriptedStore {
        inner: MemoryKvStore,
        held_write_delay: Duration,
        set_many_budget: Option<Arc<AtomicUsize>>,
    }

    #[async_trait]
    impl KvStore for ScriptedStore {
        type Error = turtle_kv_memory::Error;

        async fn set_if_absent(
            &self,
            key: &str,
            value: Bytes,
            ttl: Duration,
        ) -> std::result::Result<bool, Self::Error> {
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn set_if_held(
            &self,
            key: &str,
            value: Bytes,
            ttl: Duration,
        ) -> std::result::Result<bool, Self::Error> {
            tokio::time::sleep(self.held_write_delay).await;
            self.inner.set_if_held(key, value, ttl).await
        }

        async fn set_many(
            &self,
            requests: Vec<SetRequest>,
        ) -> std::result::Result<Vec<bool>, Self::Error> {
            if let Some(budget) = &self.set_many_budget {
                budget
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .map_err(|_| turtle_kv_memory::Error::Unavailable)?;
            }
            self.inner.set_many(requests).await
        }

        async fn get(&self, key: &str) -> std::result::Result<Option<Bytes>, Self::Error> {
            self.inner.get(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<bool, Self::Error> {
            self.inner.expire(key, ttl).await
        }

        async fn del(&self, key: &str) -> std::result::Result<(), Self::Error> {
            self.inner.del(key).await
        }

        async fn get_versioned(
            &self,
            key: &str,
        ) -> std::result::Result<Option<Versioned>, Self::Error> {
            self.inner.get_versioned(key).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            value: Bytes,
            expected: Option<u64>,
        ) -> std::result::Result<CasOutcome, Self::Error> {
            self.inner.compare_and_swap(key, value, expected).await
        }
    }

    fn generate_identity(suffix: &str) -> String {
        format!("test_holder_{}_{}", suffix, Uuid::new_v4().as_hyphenated())
    }

    fn create_lock(store: &MemoryKvStore, retries: i64) -> DistributedLock<MemoryKvStore> {
        DistributedLock::new(
            store.clone(),
            LockConfig {
                retries,
                ..LockConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = MemoryKvStore::new();
        let lock = create_lock(&store, 0);
        let me = generate_identity("me");

        assert!(lock.acquire("resource", &me).await.unwrap());
        assert_eq!(
            lock.check("resource", &me).await.unwrap(),
            LockStatus::HeldBySelf
        );
        assert_eq!(
            lock.release("resource", &me).await.unwrap(),
            ReleaseStatus::Released
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_identity_cannot_acquire_held_key() {
        let store = MemoryKvStore::new();
        let lock1 = create_lock(&store, 0);
        let lock2 = create_lock(&store, 3);
        let id1 = generate_identity("one");
        let id2 = generate_identity("two");

        assert!(lock1.acquire("resource", &id1).await.unwrap());
        assert!(!lock2.acquire("resource", &id2).await.unwrap());
        assert_eq!(
            lock2.check("resource", &id2).await.unwrap(),
            LockStatus::HeldByOther(id1.clone())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_with_wrong_identity_keeps_holder() {
        let store = MemoryKvStore::new();
        let lock = create_lock(&store, 0);
        let holder = generate_identity("holder");
        let intruder = generate_identity("intruder");

        assert!(lock.acquire("resource", &holder).await.unwrap());
        assert_eq!(
            lock.release("resource", &intruder).await.unwrap(),
            ReleaseStatus::NotOwner
        );

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(
            lock.check("resource", &holder).await.unwrap(),
            LockStatus::HeldBySelf
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_acquires_after_release() {
        let store = MemoryKvStore::new();
        let lock = create_lock(&store, -1);
        let holder = generate_identity("holder");
        let waiter = generate_identity("waiter");

        assert!(lock.acquire("resource", &holder).await.unwrap());

        let waiting = {
            let lock = lock.clone();
            let waiter = waiter.clone();
            tokio::spawn(async move { lock.acquire("resource", &waiter).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        assert_eq!(lock.waiters("resource"), 1);

        lock.release("resource", &holder).await.unwrap();

        assert!(waiting.await.unwrap().unwrap());
        assert_eq!(
            lock.check("resource", &waiter).await.unwrap(),
            LockStatus::HeldBySelf
        );
        assert_eq!(lock.waiters("resource"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutual_exclusion_between_contenders() {
        let store = MemoryKvStore::new();
        let lock = create_lock(&store, -1);
        let inside = Arc::new(Mutex::new(0_usize));
        let max_inside = Arc::new(Mutex::new(0_usize));

        let mut handles = Vec::new();
        for i in 0..5 {
            let lock = lock.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let me = generate_identity(&i.to_string());
                assert!(lock.acquire("critical", &me).await.unwrap());
                {
                    let mut count = inside.lock();
                    *count += 1;
                    let mut max = max_inside.lock();
                    *max = (*max).max(*count);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                *inside.lock() -= 1;
                lock.release("critical", &me).await.unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*max_inside.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_exceeded() {
        let store = MemoryKvStore::new();
        let lock = DistributedLock::new(
            store,
            LockConfig {
                waiter_threshold: 1,
                ..LockConfig::default()
            },
        );
        let holder = generate_identity("holder");

        assert!(lock.acquire("hot", &holder).await.unwrap());

        let waiting = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("hot", &generate_identity("waiter")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = lock.acquire("hot", &generate_identity("late")).await;
        assert_matches!(result, Err(Error::ContentionExceeded { waiters: 1, .. }));

        lock.release("hot", &holder).await.unwrap();
        assert!(waiting.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_empty_key() {
        let lock = create_lock(&MemoryKvStore::new(), 0);

        assert_matches!(lock.acquire("", "me").await, Err(Error::EmptyKey));
        assert_matches!(lock.acquire_many(&[], "me").await, Err(Error::EmptyKey));
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = MemoryKvStore::new();
        let lock = create_lock(&store, 0);
        store.set_unavailable(true);

        assert_matches!(lock.acquire("resource", "me").await, Err(Error::Store(_)));
        assert_eq!(lock.waiters("resource"), 0);
    }

    #[tokio::test]
    async fn test_acquire_many() {
        let store = MemoryKvStore::new();
        let lock = create_lock(&store, 0);
        let me = generate_identity("me");

        assert!(lock.acquire_many(&["a", "b", "c"], &me).await.unwrap());
        for key in ["a", "b", "c"] {
            assert_eq!(lock.check(key, &me).await.unwrap(), LockStatus::HeldBySelf);
        }

        let statuses = lock.release_many(&["a", "b", "c"], &me).await.unwrap();
        assert_eq!(statuses, vec![ReleaseStatus::Released; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_many_exhausted_holds_nothing() {
        let store = MemoryKvStore::new();
        let lock = create_lock(&store, 2);
        let me = generate_identity("me");
        let other = generate_identity("other");

        assert!(lock.acquire("b", &other).await.unwrap());
        assert!(!lock.acquire_many(&["a", "b"], &me).await.unwrap());

        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(lock.check("a", &me).await.unwrap(), LockStatus::Free);
        assert_eq!(
            lock.check("b", &me).await.unwrap(),
            LockStatus::HeldByOther(other)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_many_keeps_partial_hold_until_complete() {
        let store = MemoryKvStore::new();
        let lock = create_lock(&store, -1);
        let me = generate_identity("me");
        let other = generate_identity("other");

        assert!(
            lock.acquire_with("b", &other, Duration::from_millis(100), 0)
                .await
                .unwrap()
        );

        let acquiring = {
            let lock = lock.clone();
            let me = me.clone();
            tokio::spawn(async move { lock.acquire_many(&["a", "b"], &me).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lock.check("a", &me).await.unwrap(), LockStatus::HeldBySelf);

        assert!(acquiring.await.unwrap().unwrap());
        assert_eq!(lock.check("b", &me).await.unwrap(), LockStatus::HeldBySelf);
    }

    #[tokio::test]
    async fn test_release_absent() {
        let lock = create_lock(&MemoryKvStore::new(), 0);

        assert_eq!(
            lock.release("nothing", "me").await.unwrap(),
            ReleaseStatus::Absent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_release_does_not_revoke_new_holder() {
        let store = ScriptedStore {
            held_write_delay: Duration::from_millis(50),
            ..ScriptedStore::default()
        };
        let lock = DistributedLock::new(store, LockConfig::default());
        let first = generate_identity("first");
        let second = generate_identity("second");

        assert!(
            lock.acquire_with("r", &first, Duration::from_millis(20), 0)
                .await
                .unwrap()
        );

        let releasing = {
            let lock = lock.clone();
            let first = first.clone();
            tokio::spawn(async move { lock.release("r", &first).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock.acquire_with("r", &second, Duration::from_secs(5), 0).await.unwrap());

        assert_eq!(releasing.await.unwrap().unwrap(), ReleaseStatus::NotOwner);
        assert_eq!(
            lock.check("r", &second).await.unwrap(),
            LockStatus::HeldBySelf
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_many_store_failure_releases_held_keys() {
        let store = ScriptedStore {
            set_many_budget: Some(Arc::new(AtomicUsize::new(1))),
            ..ScriptedStore::default()
        };
        let lock = DistributedLock::new(store, LockConfig::default());
        let me = generate_identity("me");
        let other = generate_identity("other");

        assert!(lock.acquire("b", &other).await.unwrap());

        let result = lock.acquire_many(&["a", "b"], &me).await;
        assert_matches!(result, Err(Error::Store(_)));

        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(lock.check("a", &me).await.unwrap(), LockStatus::Free);
        assert_eq!(
            lock.check("b", &me).await.unwrap(),
            LockStatus::HeldByOther(other)
        );
    }

    #[tokio::test]
    async fn test_acquire_many_collapses_duplicate_keys() {
        let store = MemoryKvStore::new();
        let lock = create_lock(&store, 0);
        let me = generate_identity("me");

        assert!(lock.acquire_many(&["a", "a", "b"], &me).await.unwrap());
        assert_eq!(lock.check("a", &me).await.unwrap(), LockStatus::HeldBySelf);
        assert_eq!(lock.check("b", &me).await.unwrap(), LockStatus::HeldBySelf);
    }
}
