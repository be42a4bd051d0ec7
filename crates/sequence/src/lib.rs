//! Distributed identifier generator.
//!
//! Every service instance negotiates a unique integer header through a
//! compare-and-swap loop on a shared counter key, then packs
//! `header · 2^40 + timestamp · 2^12 + sequence` into one identifier.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod clock;
mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};

use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use turtle_kv::{CasOutcome, KvStore};

const HEADER_SHIFT: u32 = 40;
const TIMESTAMP_SHIFT: u32 = 12;

/// Identifiers per second per instance are bounded by this (exclusive).
pub const SEQUENCE_LIMIT: u64 = 1 << TIMESTAMP_SHIFT;

const TIMESTAMP_LIMIT: u64 = 1 << (HEADER_SHIFT - TIMESTAMP_SHIFT);

/// 2024-01-01T00:00:00Z
pub const DEFAULT_EPOCH_SECS: u64 = 1_704_067_200;

/// How often the header is negotiated.
#[derive(Clone, Debug)]
pub enum HeaderPolicy {
    /// Once per generator, kept for the process lifetime.
    Fixed,

    /// Read from the file if present, otherwise negotiated once and written
    /// there, so restarts reuse it.
    Persisted(PathBuf),

    /// Renegotiated on every call.
    PerCall,
}

/// Configuration for the `Sequence`.
#[derive(Clone, Debug)]
pub struct SequenceConfig {
    /// Shared key holding the last handed-out header.
    pub counter_key: String,

    /// When to negotiate the header.
    pub header_policy: HeaderPolicy,

    /// Unix seconds that timestamps are relative to.
    pub epoch_secs: u64,
}

impl SequenceConfig {
    /// Configuration with a fixed header and the default epoch.
    pub fn new<K: Into<String>>(counter_key: K) -> Self {
        Self {
            counter_key: counter_key.into(),
            header_policy: HeaderPolicy::Fixed,
            epoch_secs: DEFAULT_EPOCH_SECS,
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    timestamp: u64,
    sequence: u64,
}

/// Generates identifiers unique across all instances sharing a counter key.
pub struct Sequence<S: KvStore, C: Clock = SystemClock> {
    store: S,
    clock: C,
    config: SequenceConfig,
    header: tokio::sync::Mutex<Option<u64>>,
    bucket: Mutex<Bucket>,
}

impl<S: KvStore> Sequence<S> {
    /// Creates a generator reading the system clock.
    pub fn new(store: S, config: SequenceConfig) -> Self {
        Self::with_clock(store, config, SystemClock)
    }
}

impl<S: KvStore, C: Clock> Sequence<S, C> {
    /// Creates a generator reading `clock`.
    pub fn with_clock(store: S, config: SequenceConfig, clock: C) -> Self {
        Self {
            store,
            clock,
            config,
            header: tokio::sync::Mutex::new(None),
            bucket: Mutex::new(Bucket::default()),
        }
    }

    /// Returns the header, negotiating it according to the policy.
    ///
    /// # Errors
    ///
    /// Fails when the store is unreachable or the header file is unusable.
    pub async fn header(&self) -> Result<u64> {
        let mut cached = self.header.lock().await;

        if !matches!(self.config.header_policy, HeaderPolicy::PerCall) {
            if let Some(header) = *cached {
                return Ok(header);
            }
        }

        let header = match &self.config.header_policy {
            HeaderPolicy::Fixed | HeaderPolicy::PerCall => self.negotiate_header().await?,
            HeaderPolicy::Persisted(path) => {
                if let Some(header) = read_header_file(path).await? {
                    debug!(header, path = %path.display(), "reusing persisted header");
                    header
                } else {
                    let header = self.negotiate_header().await?;
                    tokio::fs::write(path, header.to_string()).await?;
                    header
                }
            }
        };

        *cached = Some(header);
        Ok(header)
    }

    /// Claims the next header value from the shared counter key.
    ///
    /// Conflicting writers are retried without bound; contention is expected
    /// to be rare.
    async fn negotiate_header(&self) -> Result<u64> {
        let key = &self.config.counter_key;

        loop {
            let current = self.store.get_versioned(key).await.map_err(Error::store)?;
            let (next, expected) = match current {
                Some(versioned) => (
                    parse_counter(key, &versioned.value)? + 1,
                    Some(versioned.revision),
                ),
                None => (1, None),
            };

            match self
                .store
                .compare_and_swap(key, Bytes::from(next.to_string()), expected)
                .await
                .map_err(Error::store)?
            {
                CasOutcome::Swapped(_) => {
                    info!(header = next, key = %key, "sequence header negotiated");
                    return Ok(next);
                }
                CasOutcome::Conflict => {
                    debug!(key = %key, "header negotiation conflict, retrying");
                }
            }
        }
    }

    fn next_slot(&self) -> Result<(u64, u64)> {
        let now = self.clock.now_secs();
        let timestamp = now
            .checked_sub(self.config.epoch_secs)
            .ok_or(Error::ClockBeforeEpoch {
                epoch_secs: self.config.epoch_secs,
            })?;
        if timestamp >= TIMESTAMP_LIMIT {
            return Err(Error::TimestampOutOfRange(timestamp));
        }

        // A clock stepping back keeps counting in the latest second seen.
        let mut bucket = self.bucket.lock();
        if timestamp > bucket.timestamp {
            bucket.timestamp = timestamp;
            bucket.sequence = 0;
        } else if timestamp < bucket.timestamp {
            warn!(
                timestamp,
                latest = bucket.timestamp,
                "clock moved backwards, continuing the latest second"
            );
        }
        let timestamp = bucket.timestamp;
        if bucket.sequence + 1 >= SEQUENCE_LIMIT {
            return Err(Error::Overflow { timestamp });
        }
        bucket.sequence += 1;

        Ok((timestamp, bucket.sequence))
    }

    /// Generates the next identifier.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Overflow`] once 4095 identifiers were produced in
    /// the current second, and when the header cannot be obtained. If the
    /// clock goes back, identifiers keep coming from the latest second seen
    /// until the clock catches up.
    pub async fn next_id(&self) -> Result<u128> {
        let header = self.header().await?;
        let (timestamp, sequence) = self.next_slot()?;

        Ok((u128::from(header) << HEADER_SHIFT)
            + (u128::from(timestamp) << TIMESTAMP_SHIFT)
            + u128::from(sequence))
    }

    /// Generates the next identifier rendered in `radix` (2 to 36).
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidRadix`] for an unsupported radix, otherwise
    /// as [`Sequence::next_id`].
    pub async fn next_id_string(&self, radix: u32) -> Result<String> {
        if !(2..=36).contains(&radix) {
            return Err(Error::InvalidRadix(radix));
        }
        Ok(to_radix(self.next_id().await?, radix))
    }
}

fn parse_counter(key: &str, value: &[u8]) -> Result<u64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| Error::CorruptCounter {
            key: key.to_string(),
        })
}

async fn read_header_file(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::CorruptHeaderFile {
                path: path.to_path_buf(),
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn to_radix(mut value: u128, radix: u32) -> String {
    if value == 0 {
        return "0".to_string();
    }

    let radix = u128::from(radix);
    let mut digits = Vec::new();
    while value > 0 {
        #[allow(clippy::cast_possible_truncation)]
        let digit = (value % radix) as u32;
        digits.push(std::char::from_digit(digit, 36).unwrap_or('?'));
        value /= radix;
    }
    digits.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use turtle_kv_memory::MemoryKvStore;

    const NOW: u64 = DEFAULT_EPOCH_SECS + 1_000;

    fn manual_sequence(
        store: &MemoryKvStore,
        policy: HeaderPolicy,
    ) -> (Sequence<MemoryKvStore, ManualClock>, ManualClock) {
        let clock = ManualClock::new(NOW);
        let config = SequenceConfig {
            header_policy: policy,
            ..SequenceConfig::new("seq:orders")
        };
        (
            Sequence::with_clock(store.clone(), config, clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_id_layout() {
        let store = MemoryKvStore::new();
        let (sequence, _clock) = manual_sequence(&store, HeaderPolicy::Fixed);

        let id = sequence.next_id().await.unwrap();

        assert_eq!(id >> HEADER_SHIFT, 1);
        assert_eq!((id >> TIMESTAMP_SHIFT) & u128::from(TIMESTAMP_LIMIT - 1), 1_000);
        assert_eq!(id & u128::from(SEQUENCE_LIMIT - 1), 1);
    }

    #[tokio::test]
    async fn test_overflow_within_one_second() {
        let store = MemoryKvStore::new();
        let (sequence, clock) = manual_sequence(&store, HeaderPolicy::Fixed);

        let mut last = 0;
        for _ in 0..4095 {
            let id = sequence.next_id().await.unwrap();
            assert!(id > last);
            last = id;
        }

        assert_matches!(
            sequence.next_id().await,
            Err(Error::Overflow { timestamp: 1_000 })
        );

        clock.advance(1);
        let id = sequence.next_id().await.unwrap();
        assert!(id > last);
        assert_eq!(id & u128::from(SEQUENCE_LIMIT - 1), 1);
    }

    #[tokio::test]
    async fn test_clock_step_back_keeps_ids_unique() {
        let store = MemoryKvStore::new();
        let (sequence, clock) = manual_sequence(&store, HeaderPolicy::Fixed);

        let first = sequence.next_id().await.unwrap();
        clock.advance(1);
        let second = sequence.next_id().await.unwrap();
        clock.set(NOW);
        let third = sequence.next_id().await.unwrap();

        assert!(second > first);
        assert!(third > second);
        assert_eq!(third >> TIMESTAMP_SHIFT, second >> TIMESTAMP_SHIFT);
        assert_eq!(third & u128::from(SEQUENCE_LIMIT - 1), 2);

        clock.set(NOW + 2);
        let fourth = sequence.next_id().await.unwrap();
        assert!(fourth > third);
        assert_eq!(fourth & u128::from(SEQUENCE_LIMIT - 1), 1);
    }

    #[tokio::test]
    async fn test_instances_get_distinct_headers() {
        let store = MemoryKvStore::new();
        let (first, _) = manual_sequence(&store, HeaderPolicy::Fixed);
        let (second, _) = manual_sequence(&store, HeaderPolicy::Fixed);

        let a = first.next_id().await.unwrap();
        let b = second.next_id().await.unwrap();

        assert_ne!(a >> HEADER_SHIFT, b >> HEADER_SHIFT);
        assert_eq!(first.header().await.unwrap(), 1);
        assert_eq!(second.header().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_negotiation_is_unique() {
        let store = MemoryKvStore::new();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let sequence = Arc::new(manual_sequence(&store, HeaderPolicy::Fixed).0);
            handles.push(tokio::spawn(async move { sequence.header().await.unwrap() }));
        }

        let mut headers = Vec::new();
        for handle in handles {
            headers.push(handle.await.unwrap());
        }
        headers.sort_unstable();

        assert_eq!(headers, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_per_call_policy_renegotiates() {
        let store = MemoryKvStore::new();
        let (sequence, _) = manual_sequence(&store, HeaderPolicy::PerCall);

        let a = sequence.next_id().await.unwrap();
        let b = sequence.next_id().await.unwrap();

        assert_eq!(a >> HEADER_SHIFT, 1);
        assert_eq!(b >> HEADER_SHIFT, 2);
    }

    #[tokio::test]
    async fn test_persisted_header_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header");
        let store = MemoryKvStore::new();

        let (first, _) = manual_sequence(&store, HeaderPolicy::Persisted(path.clone()));
        assert_eq!(first.header().await.unwrap(), 1);

        let (restarted, _) = manual_sequence(&store, HeaderPolicy::Persisted(path.clone()));
        assert_eq!(restarted.header().await.unwrap(), 1);

        let (fresh, _) = manual_sequence(&store, HeaderPolicy::Fixed);
        assert_eq!(fresh.header().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_header_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header");
        std::fs::write(&path, "not a number").unwrap();

        let (sequence, _) = manual_sequence(&MemoryKvStore::new(), HeaderPolicy::Persisted(path));

        assert_matches!(
            sequence.header().await,
            Err(Error::CorruptHeaderFile { .. })
        );
    }

    #[tokio::test]
    async fn test_store_unavailable() {
        let store = MemoryKvStore::new();
        store.set_unavailable(true);
        let (sequence, _) = manual_sequence(&store, HeaderPolicy::Fixed);

        assert_matches!(sequence.next_id().await, Err(Error::Store(_)));
    }

    #[tokio::test]
    async fn test_radix_rendering() {
        let store = MemoryKvStore::new();
        let (sequence, _) = manual_sequence(&store, HeaderPolicy::Fixed);

        let rendered = sequence.next_id_string(16).await.unwrap();
        let id = u128::from_str_radix(&rendered, 16).unwrap();
        assert_eq!(id >> HEADER_SHIFT, 1);

        assert_matches!(
            sequence.next_id_string(37).await,
            Err(Error::InvalidRadix(37))
        );
        assert_eq!(to_radix(0, 2), "0");
        assert_eq!(to_radix(255, 2), "11111111");
        assert_eq!(to_radix(35, 36), "z");
    }

    #[tokio::test]
    async fn test_clock_before_epoch() {
        let clock = ManualClock::new(DEFAULT_EPOCH_SECS - 1);
        let sequence = Sequence::with_clock(
            MemoryKvStore::new(),
            SequenceConfig::new("seq"),
            clock,
        );

        assert_matches!(
            sequence.next_id().await,
            Err(Error::ClockBeforeEpoch { .. })
        );
    }
}
