//! In-memory [`SharedStore`] for tests and benchmarks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::*}},
    time::Duration
};
use crate::error::{Error, Result};
use super::{BucketKeys, SharedStore, StoredBucket, Watched};

/// A [`SharedStore`] kept in process memory.
///
/// Clones share the same entries, so several [`DistributedBucketStore`](super::DistributedBucketStore)s
/// built over clones of one `MemoryStore` behave like separate service
/// instances talking to one external store.
///
/// With the `test-util` feature, failures can be injected to exercise
/// error paths: unavailability, latency and lost optimistic races.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    interfere: AtomicU32,
}

impl MemoryStore {
    /// Creates an empty store.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    /// Stores a raw `value` under `key`, bypassing any version check.
    pub fn insert(&self, key: &str, value: &str) {
        self.entries().insert(key.to_owned(), value.to_owned());
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Makes every following operation fail with [`Error::StoreUnavailable`] until re-enabled.
    #[cfg(any(test, feature = "test-util"))]
    #[inline]
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Release);
    }

    /// Delays every following operation by `latency`.
    #[cfg(any(test, feature = "test-util"))]
    #[inline]
    pub fn set_latency(&self, latency: Duration) {
        let latency: u64 = latency.as_millis().try_into().unwrap_or(u64::MAX);
        self.inner.latency_ms.store(latency, Release);
    }

    /// Makes the next `count` commits lose the race against a foreign writer.
    ///
    /// Right before each of these commits the bucket's timestamp is rewritten,
    /// exactly as a concurrent process would.
    #[cfg(any(test, feature = "test-util"))]
    #[inline]
    pub fn interfere_with_next_commits(&self, count: u32) {
        self.inner.interfere.store(count, Release);
    }

    async fn enter(&self) -> Result<()> {
        let latency = self.inner.latency_ms.load(Acquire);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.unavailable.load(Acquire) {
            return Err(Error::StoreUnavailable("memory store is disabled".into()));
        }
        Ok(())
    }

    fn take_interference(&self) -> bool {
        self.inner.interfere
            .fetch_update(AcqRel, Acquire, |left| left.checked_sub(1))
            .is_ok()
    }

    #[inline]
    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SharedStore for MemoryStore {
    async fn watch(&self, keys: &BucketKeys) -> Result<Watched> {
        self.enter().await?;
        let entries = self.entries();
        Ok(Watched::new(keys.all().map(|key| entries.get(key).cloned())))
    }

    async fn commit(
        &self,
        keys: &BucketKeys,
        watched: &Watched,
        tokens: u64,
        last_update_ms: u64
    ) -> Result<bool> {
        self.enter().await?;
        let mut entries = self.entries();

        if self.take_interference() {
            let foreign = entries
                .get(&keys.last_update)
                .and_then(|value| value.parse::<u64>().ok())
                .map_or(0, |value| value.wrapping_add(1));
            entries.insert(keys.last_update.clone(), foreign.to_string());
        }

        let unchanged = keys
            .all()
            .iter()
            .zip(watched.values())
            .all(|(key, expected)| entries.get(*key) == expected.as_ref());
        if !unchanged {
            return Ok(false);
        }

        entries.insert(keys.tokens.clone(), tokens.to_string());
        entries.insert(keys.last_update.clone(), last_update_ms.to_string());
        Ok(true)
    }

    async fn put(&self, keys: &BucketKeys, bucket: &StoredBucket) -> Result<()> {
        self.enter().await?;
        let mut entries = self.entries();

        entries.insert(keys.tokens.clone(), bucket.tokens.to_string());
        entries.insert(keys.last_update.clone(), bucket.last_update_ms.to_string());
        match bucket.policy {
            Some(policy) => {
                entries.insert(keys.capacity.clone(), policy.capacity.to_string());
                entries.insert(keys.refill_rate.clone(), policy.refill_rate.to_string());
            }
            None => {
                entries.remove(&keys.capacity);
                entries.remove(&keys.refill_rate);
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.enter().await
    }
}
