//! Tools and data structures for an in-process token-bucket store.

use super::{BucketPolicy, BucketRecord, BucketStore, Decision, RefillMode, SystemTimeSource, TimeSource};
use crate::error::Result;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bucket shared between the registry and in-flight checks.
type SharedRecord = Arc<Mutex<BucketRecord>>;

/// An in-process token-bucket store.
///
/// Buckets live in a concurrent registry keyed by client identifier and
/// are created lazily on the first check of an unseen client.
///
/// ## Characteristics
///
/// - **Atomic lookup-or-create**: concurrent first checks of one client
///   always end up on the same bucket.
/// - **Per-bucket critical section**: refill and consume run under a mutex
///   owned by the bucket; clients never contend with each other.
/// - **No I/O**: every operation completes without suspending.
///
/// ## Algorithm
///
/// For each `client_id`:
///
/// 1. If at least one second elapsed since the last refill,
///    add `floor(elapsed_secs) * refill_rate` tokens.
/// 2. Clamp tokens to `capacity`.
/// 3. If at least one token is available, consume it and allow the request.
/// 4. Otherwise, deny the request.
///
/// ## Growth
///
/// Buckets are never evicted: the registry grows with the number of
/// distinct clients for the lifetime of the store.
#[derive(Debug)]
pub struct LocalBucketStore<T: TimeSource = SystemTimeSource> {
    /// Per-client buckets.
    buckets: DashMap<String, SharedRecord>,

    /// Policy applied to buckets created on first check.
    policy: BucketPolicy,

    /// How refill timestamps advance.
    refill_mode: RefillMode,

    /// Time source used to determine the current time.
    time_source: T,
}

impl Default for LocalBucketStore {
    #[inline]
    fn default() -> Self {
        Self::from_parts(BucketPolicy::default(), SystemTimeSource)
    }
}

impl LocalBucketStore {
    /// Creates a new store using the system clock.
    ///
    /// Buckets created on first check use `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`](crate::Error::InvalidConfiguration)
    /// if the capacity or refill rate of `policy` is zero.
    #[inline]
    pub fn new(policy: BucketPolicy) -> Result<Self> {
        Self::with_time_source(policy, SystemTimeSource)
    }
}

impl<T: TimeSource> LocalBucketStore<T> {
    /// Creates a [`LocalBucketStore`] with a custom [`TimeSource`].
    ///
    /// This is primarily useful for testing and deterministic scenarios.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`](crate::Error::InvalidConfiguration)
    /// if the capacity or refill rate of `policy` is zero.
    #[inline]
    pub fn with_time_source(policy: BucketPolicy, time_source: T) -> Result<Self> {
        policy.validate()?;
        Ok(Self::from_parts(policy, time_source))
    }

    #[inline]
    fn from_parts(policy: BucketPolicy, time_source: T) -> Self {
        Self {
            buckets: DashMap::new(),
            policy,
            refill_mode: RefillMode::default(),
            time_source,
        }
    }

    /// Sets how refill timestamps advance.
    #[inline]
    pub fn with_refill_mode(mut self, refill_mode: RefillMode) -> Self {
        self.refill_mode = refill_mode;
        self
    }

    /// Policy applied to buckets created on first check.
    #[inline(always)]
    pub fn policy(&self) -> BucketPolicy {
        self.policy
    }

    /// Configured refill mode.
    #[inline(always)]
    pub fn refill_mode(&self) -> RefillMode {
        self.refill_mode
    }

    /// Number of clients with a bucket.
    #[inline]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Returns `true` if no client has a bucket yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Refills the client's bucket and attempts to consume one token.
    pub fn check(&self, client_id: &str) -> Decision {
        let now = self.time_source.now_millis();
        let bucket = self.bucket(client_id, now);

        let mut record = lock(&bucket);
        record.refill(now, self.refill_mode);
        let allowed = record.try_consume();
        record.decision(allowed)
    }

    /// Returns the refilled state of the client's bucket without consuming a token.
    ///
    /// `allowed` reports whether the next check would be admitted.
    /// Returns `None` for an unseen client; no bucket is created.
    pub fn status(&self, client_id: &str) -> Option<Decision> {
        let bucket = self.buckets
            .get(client_id)
            .map(|entry| entry.value().clone())?;

        let now = self.time_source.now_millis();
        let mut record = lock(&bucket);
        record.refill(now, self.refill_mode);
        Some(record.decision(record.tokens() > 0))
    }

    /// Replaces the client's bucket with a full one using `capacity` and `refill_rate`.
    ///
    /// The replacement is not synchronized with checks already in flight
    /// for the same client: the last write wins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`](crate::Error::InvalidConfiguration)
    /// if `capacity` or `refill_rate` is zero.
    pub fn reset(&self, client_id: &str, capacity: u64, refill_rate: u64) -> Result<()> {
        let policy = BucketPolicy::new(capacity, refill_rate)?;
        self.replace(client_id, policy);
        Ok(())
    }

    fn replace(&self, client_id: &str, policy: BucketPolicy) {
        let now = self.time_source.now_millis();
        let record = BucketRecord::new(client_id, policy, now);
        self.buckets.insert(client_id.to_owned(), Arc::new(Mutex::new(record)));
    }

    /// Looks up the client's bucket, inserting a full one if absent.
    ///
    /// The registry shard lock is released before the caller locks the bucket.
    fn bucket(&self, client_id: &str, now: u64) -> SharedRecord {
        if let Some(entry) = self.buckets.get(client_id) {
            return entry.value().clone();
        }

        self.buckets
            .entry(client_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(BucketRecord::new(client_id, self.policy, now))))
            .value()
            .clone()
    }
}

impl<T: TimeSource> BucketStore for LocalBucketStore<T> {
    async fn check(&self, client_id: &str) -> Result<Decision> {
        Ok(LocalBucketStore::check(self, client_id))
    }

    async fn status(&self, client_id: &str) -> Result<Option<Decision>> {
        Ok(LocalBucketStore::status(self, client_id))
    }

    async fn reset(&self, client_id: &str, policy: BucketPolicy) -> Result<()> {
        policy.validate()?;
        self.replace(client_id, policy);
        Ok(())
    }
}

/// Locks a bucket, recovering it if a previous holder panicked.
///
/// A record is plain data that is never left half-updated,
/// so a poisoned lock still guards a consistent state.
#[inline]
fn lock(bucket: &Mutex<BucketRecord>) -> MutexGuard<'_, BucketRecord> {
    bucket.lock().unwrap_or_else(PoisonError::into_inner)
}
