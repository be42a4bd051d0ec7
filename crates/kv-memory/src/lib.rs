//! In-memory (single node) implementation of the coordination key-value store
//! for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;
use turtle_kv::{CasOutcome, KvStore, SetCondition, SetRequest, Versioned};

#[derive(Clone, Debug)]
struct Entry {
    value: Bytes,
    revision: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    map: Mutex<HashMap<String, Entry>>,
    revision: AtomicU64,
    unavailable: AtomicBool,
}

/// In-memory key-value store.
///
/// Clones share the same underlying map, so several clones behave like several
/// clients of one external store.
#[derive(Clone, Debug, Default)]
pub struct MemoryKvStore {
    inner: Arc<Inner>,
}

impl MemoryKvStore {
    /// Creates a new `MemoryKvStore`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with [`Error::Unavailable`] until
    /// switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }
        Ok(())
    }

    fn next_revision(&self) -> u64 {
        self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn entry(&self, value: Bytes, ttl: Option<Duration>) -> Entry {
        Entry {
            value,
            revision: self.next_revision(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn apply(&self, map: &mut HashMap<String, Entry>, request: SetRequest) -> bool {
        let now = Instant::now();
        let current = map.get(&request.key).filter(|entry| entry.is_live(now));
        let allowed = match (&request.condition, current) {
            (SetCondition::IfAbsent, None) => true,
            (SetCondition::IfHeldBy(held), Some(entry)) => entry.value == *held,
            _ => false,
        };
        if allowed {
            let entry = self.entry(request.value, Some(request.ttl));
            map.insert(request.key, entry);
        }
        allowed
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    type Error = Error;

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        self.check_available()?;
        let mut map = self.inner.map.lock().await;
        Ok(self.apply(
            &mut map,
            SetRequest {
                key: key.to_string(),
                value,
                ttl,
                condition: SetCondition::IfAbsent,
            },
        ))
    }

    async fn set_if_held(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        self.check_available()?;
        let mut map = self.inner.map.lock().await;
        Ok(self.apply(
            &mut map,
            SetRequest {
                key: key.to_string(),
                condition: SetCondition::IfHeldBy(value.clone()),
                value,
                ttl,
            },
        ))
    }

    async fn set_many(&self, requests: Vec<SetRequest>) -> Result<Vec<bool>, Self::Error> {
        self.check_available()?;
        let mut map = self.inner.map.lock().await;
        Ok(requests
            .into_iter()
            .map(|request| self.apply(&mut map, request))
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Self::Error> {
        Ok(self.get_versioned(key).await?.map(|versioned| versioned.value))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Self::Error> {
        self.check_available()?;
        let now = Instant::now();
        let mut map = self.inner.map.lock().await;
        match map.get_mut(key).filter(|entry| entry.is_live(now)) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<(), Self::Error> {
        self.check_available()?;
        self.inner.map.lock().await.remove(key);
        Ok(())
    }

    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned>, Self::Error> {
        self.check_available()?;
        let now = Instant::now();
        let map = self.inner.map.lock().await;
        Ok(map
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| Versioned {
                value: entry.value.clone(),
                revision: entry.revision,
            }))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<u64>,
    ) -> Result<CasOutcome, Self::Error> {
        self.check_available()?;
        let now = Instant::now();
        let mut map = self.inner.map.lock().await;
        let current = map
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.revision);
        if current != expected {
            return Ok(CasOutcome::Conflict);
        }
        let entry = self.entry(value, None);
        let revision = entry.revision;
        map.insert(key.to_string(), entry);
        Ok(CasOutcome::Swapped(revision))
    }
}
