//! Abstract interface for the external key-value store that instances of a
//! service coordinate through.
//!
//! Strong consistency is delegated entirely to the implementation: every
//! conditional write below must be atomic on the store side.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Marker trait for `KvStore` errors
pub trait KvStoreError: Debug + Error + Send + Sync + 'static {}

/// Joins key segments with `:`, the separator used for every coordination key.
///
/// ```
/// assert_eq!(turtle_kv::join_key(&["mutex", "orders"]), "mutex:orders");
/// ```
#[must_use]
pub fn join_key(segments: &[&str]) -> String {
    segments.join(":")
}

/// A value read together with the revision it was written at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    /// The stored bytes.
    pub value: Bytes,

    /// Store-assigned revision, strictly increasing per write.
    pub revision: u64,
}

/// Result of a compare-and-swap attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied; carries the new revision.
    Swapped(u64),

    /// The stored revision did not match the expected one.
    Conflict,
}

/// Condition attached to one write of a pipelined `set_many` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetCondition {
    /// Write only if the key does not exist.
    IfAbsent,

    /// Write only if the key currently holds exactly this value.
    IfHeldBy(Bytes),
}

/// One write of a pipelined `set_many` call.
#[derive(Clone, Debug)]
pub struct SetRequest {
    /// Key to write.
    pub key: String,

    /// Value to store.
    pub value: Bytes,

    /// Expiry applied on success.
    pub ttl: Duration,

    /// Precondition of the write.
    pub condition: SetCondition,
}

/// A key-value store with the atomic primitives needed for cross-process
/// coordination.
#[async_trait]
pub trait KvStore: Clone + Send + Sync + 'static {
    /// The error type for store operations.
    type Error: KvStoreError;

    /// Atomically writes `value` with expiry `ttl` if `key` does not exist.
    ///
    /// Returns whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, Self::Error>;

    /// Atomically refreshes `key` to `value` with expiry `ttl` if it currently
    /// holds `value`.
    ///
    /// Returns whether the write happened.
    async fn set_if_held(&self, key: &str, value: Bytes, ttl: Duration)
    -> Result<bool, Self::Error>;

    /// Performs several conditional writes in one round trip.
    ///
    /// Writes are independent: the store does not roll back the ones that
    /// succeeded when others fail. The default implementation issues them one
    /// by one; stores with native pipelining should override it.
    async fn set_many(&self, requests: Vec<SetRequest>) -> Result<Vec<bool>, Self::Error> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let applied = match request.condition {
                SetCondition::IfAbsent => {
                    self.set_if_absent(&request.key, request.value, request.ttl)
                        .await?
                }
                SetCondition::IfHeldBy(held) => {
                    if held == request.value {
                        self.set_if_held(&request.key, request.value, request.ttl)
                            .await?
                    } else {
                        false
                    }
                }
            };
            results.push(applied);
        }
        Ok(results)
    }

    /// Reads the value of `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Self::Error>;

    /// Resets the expiry of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Self::Error>;

    /// Deletes `key`.
    async fn del(&self, key: &str) -> Result<(), Self::Error>;

    /// Reads the value of `key` together with its revision.
    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned>, Self::Error>;

    /// Writes `value` only if the stored revision equals `expected`.
    ///
    /// `expected == None` means the key must not exist yet.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<u64>,
    ) -> Result<CasOutcome, Self::Error>;
}
