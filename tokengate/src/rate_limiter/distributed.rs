//! Tools and data structures for a token-bucket store shared between processes.
//!
//! Bucket state lives in an external key-value store behind the
//! [`SharedStore`] seam. No process holds authoritative state in memory;
//! concurrent writers are coordinated with optimistic concurrency:
//!
//! 1. [`SharedStore::watch`] reads every entry of a client's bucket.
//! 2. The refill and consume are computed locally.
//! 3. [`SharedStore::commit`] writes the result only if none of the watched
//!    entries changed in between. A rejected commit is retried with a
//!    bounded exponential backoff.
//!
//! ## Layout
//!
//! Each bucket is stored as decimal strings under a common key prefix:
//!
//! ```text
//! <prefix><client_id>:tokens
//! <prefix><client_id>:last_update
//! <prefix><client_id>:capacity      (optional, written by reset)
//! <prefix><client_id>:refill_rate   (optional, written by reset)
//! ```

use std::{future::Future, time::Duration};
use crate::error::{Error, Result};
use super::{BucketPolicy, BucketStore, Decision, SystemTimeSource, TimeSource, MILLIS_PER_SEC};

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

/// Key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limiter:";

/// Time budget of a single shared store round trip used when none is configured.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);

const TOKENS_SUFFIX: &str = ":tokens";
const LAST_UPDATE_SUFFIX: &str = ":last_update";
const CAPACITY_SUFFIX: &str = ":capacity";
const REFILL_RATE_SUFFIX: &str = ":refill_rate";

/// Number of entries that make up one stored bucket.
const ENTRY_COUNT: usize = 4;

/// A key-value store shared by every process that limits the same clients.
///
/// All entries of one bucket must be read by a single [`watch`](Self::watch)
/// and written by a single [`commit`](Self::commit) or [`put`](Self::put),
/// never one at a time.
pub trait SharedStore: Send + Sync {
    /// Reads every entry of a bucket.
    ///
    /// The observed values act as the version checked by [`commit`](Self::commit).
    fn watch(&self, keys: &BucketKeys) -> impl Future<Output = Result<Watched>> + Send;

    /// Writes `tokens` and `last_update_ms` if no entry changed since `watched` was read.
    ///
    /// Returns `false` if another writer got there first. Policy entries are left untouched.
    fn commit(
        &self,
        keys: &BucketKeys,
        watched: &Watched,
        tokens: u64,
        last_update_ms: u64
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Unconditionally writes every entry of a bucket.
    ///
    /// Policy entries are removed when `bucket.policy` is `None`.
    fn put(&self, keys: &BucketKeys, bucket: &StoredBucket) -> impl Future<Output = Result<()>> + Send;

    /// Checks that the store is reachable.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Store keys of one client's bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    /// Current token count
    pub tokens: String,
    /// Time of the last update in milliseconds
    pub last_update: String,
    /// Capacity override
    pub capacity: String,
    /// Refill rate override
    pub refill_rate: String,
}

impl BucketKeys {
    /// Builds the keys of `client_id` under `prefix`.
    pub fn new(prefix: &str, client_id: &str) -> Self {
        let base = format!("{prefix}{client_id}");
        Self {
            tokens: format!("{base}{TOKENS_SUFFIX}"),
            last_update: format!("{base}{LAST_UPDATE_SUFFIX}"),
            capacity: format!("{base}{CAPACITY_SUFFIX}"),
            refill_rate: format!("{base}{REFILL_RATE_SUFFIX}"),
        }
    }

    /// Every key, in the order of [`Watched::values`].
    #[inline]
    pub fn all(&self) -> [&str; ENTRY_COUNT] {
        [&self.tokens, &self.last_update, &self.capacity, &self.refill_rate]
    }
}

/// Raw entries of a bucket as observed by [`SharedStore::watch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watched {
    values: [Option<String>; ENTRY_COUNT],
}

impl Watched {
    /// Wraps raw values ordered like [`BucketKeys::all`].
    #[inline]
    pub fn new(values: [Option<String>; ENTRY_COUNT]) -> Self {
        Self { values }
    }

    /// Raw values ordered like [`BucketKeys::all`].
    #[inline(always)]
    pub fn values(&self) -> &[Option<String>; ENTRY_COUNT] {
        &self.values
    }

    /// Parses the per-client policy written by reset, if both entries are present.
    ///
    /// The policy is read independently of the bucket state, so it survives
    /// the loss of the token count or timestamp.
    pub fn policy(&self, keys: &BucketKeys) -> Result<Option<BucketPolicy>> {
        let [_, _, capacity, refill_rate] = &self.values;
        match (parse(&keys.capacity, capacity)?, parse(&keys.refill_rate, refill_rate)?) {
            (Some(capacity), Some(refill_rate)) => {
                let policy = BucketPolicy { capacity, refill_rate };
                policy.validate().map_err(|_| Error::CorruptedRecord {
                    key: keys.capacity.clone(),
                    value: format!("{capacity}/{refill_rate}"),
                })?;
                Ok(Some(policy))
            }
            _ => Ok(None),
        }
    }

    /// Parses the watched entries.
    ///
    /// Returns `None` if either the token count or the timestamp is missing.
    pub fn bucket(&self, keys: &BucketKeys) -> Result<Option<StoredBucket>> {
        let [tokens, last_update, _, _] = &self.values;
        let policy = self.policy(keys)?;

        let tokens = parse(&keys.tokens, tokens)?;
        let last_update = parse(&keys.last_update, last_update)?;

        Ok(match (tokens, last_update) {
            (Some(tokens), Some(last_update_ms)) => Some(StoredBucket { tokens, last_update_ms, policy }),
            _ => None,
        })
    }
}

fn parse(key: &str, value: &Option<String>) -> Result<Option<u64>> {
    value
        .as_deref()
        .map(|raw| raw.trim().parse::<u64>().map_err(|_| Error::CorruptedRecord {
            key: key.to_owned(),
            value: raw.to_owned(),
        }))
        .transpose()
}

/// Parsed bucket entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBucket {
    /// Tokens available as of `last_update_ms`.
    pub tokens: u64,

    /// Time of the last update in milliseconds.
    pub last_update_ms: u64,

    /// Per-client policy written by reset, if any.
    pub policy: Option<BucketPolicy>,
}

impl StoredBucket {
    /// Tokens available at `now_ms`, clamped to the policy capacity.
    ///
    /// Unlike the local store there is no one-second threshold:
    /// `floor(elapsed_ms * refill_rate / 1000)` tokens are added.
    pub fn refilled(&self, now_ms: u64, policy: BucketPolicy) -> u64 {
        let elapsed_ms = now_ms.saturating_sub(self.last_update_ms);
        let added = (elapsed_ms as u128) * (policy.refill_rate as u128) / (MILLIS_PER_SEC as u128);
        let added = u64::try_from(added).unwrap_or(u64::MAX);

        self.tokens
            .saturating_add(added)
            .min(policy.capacity)
    }
}

/// Bounded retry of lost optimistic commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. At least 1.
    pub max_attempts: u32,

    /// Delay before the first retry; doubled for each following one.
    pub base_backoff: Duration,

    /// Upper bound of a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first lost race.
    #[inline]
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Delay to wait after the given failed `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Outcome of one optimistic attempt.
enum Attempt {
    Decided(Decision),
    Conflict,
}

/// A token-bucket store shared between processes through a [`SharedStore`].
///
/// ## Algorithm
///
/// For each `client_id`:
///
/// 1. Watch and read the client's entries.
/// 2. If the bucket is missing, create it with `capacity - 1` tokens
///    (the current request consumes one) and allow.
/// 3. Otherwise `refilled = min(capacity, tokens + floor(elapsed_ms * refill_rate / 1000))`.
/// 4. If `refilled > 0`, commit `refilled - 1` tokens and allow.
/// 5. If `refilled == 0`, deny without writing.
///
/// A lost commit restarts from step 1 after a backoff, up to
/// [`RetryPolicy::max_attempts`]; then [`Error::ConcurrentModification`]
/// is returned. Every round trip is bounded by the operation timeout and
/// reports [`Error::Timeout`] when exceeded. Store failures are never
/// turned into denials.
#[derive(Debug)]
pub struct DistributedBucketStore<S, T: TimeSource = SystemTimeSource> {
    /// Backing shared store.
    store: S,

    /// Policy of buckets without a per-client override.
    policy: BucketPolicy,

    /// Prefix of every key written by this store.
    key_prefix: String,

    /// Retry of lost optimistic commits.
    retry: RetryPolicy,

    /// Time budget of a single round trip.
    op_timeout: Duration,

    /// Time source used to determine the current time.
    time_source: T,
}

impl<S: SharedStore> DistributedBucketStore<S> {
    /// Creates a new store over `store` using the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the capacity or refill rate
    /// of `policy` is zero.
    #[inline]
    pub fn new(store: S, policy: BucketPolicy) -> Result<Self> {
        Self::with_time_source(store, policy, SystemTimeSource)
    }
}

impl<S: SharedStore, T: TimeSource> DistributedBucketStore<S, T> {
    /// Creates a [`DistributedBucketStore`] with a custom [`TimeSource`].
    ///
    /// Every process sharing the store must use the same notion of time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the capacity or refill rate
    /// of `policy` is zero.
    #[inline]
    pub fn with_time_source(store: S, policy: BucketPolicy, time_source: T) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            store,
            policy,
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            retry: RetryPolicy::default(),
            op_timeout: DEFAULT_OP_TIMEOUT,
            time_source,
        })
    }

    /// Sets the prefix of every key written by this store.
    #[inline]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the retry policy of lost optimistic commits.
    ///
    /// `max_attempts` below 1 is treated as 1.
    #[inline]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        self
    }

    /// Sets the time budget of a single round trip.
    #[inline]
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Backing shared store.
    #[inline(always)]
    pub fn shared_store(&self) -> &S {
        &self.store
    }

    /// Policy of buckets without a per-client override.
    #[inline(always)]
    pub fn policy(&self) -> BucketPolicy {
        self.policy
    }

    /// Prefix of every key written by this store.
    #[inline(always)]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Store keys of `client_id`.
    #[inline]
    pub fn keys(&self, client_id: &str) -> BucketKeys {
        BucketKeys::new(&self.key_prefix, client_id)
    }

    /// Checks whether a request from `client_id` is admitted, consuming a token if so.
    pub async fn is_allowed(&self, client_id: &str) -> Result<bool> {
        self.check(client_id)
            .await
            .map(|decision| decision.allowed)
    }

    /// Refills the client's bucket and attempts to consume one token.
    ///
    /// # Errors
    ///
    /// - [`Error::StoreUnavailable`] or [`Error::Timeout`] if the store cannot be reached.
    /// - [`Error::ConcurrentModification`] if every attempt lost the optimistic race.
    /// - [`Error::CorruptedRecord`] if an entry cannot be parsed.
    pub async fn check(&self, client_id: &str) -> Result<Decision> {
        let keys = self.keys(client_id);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_check(&keys).await? {
                Attempt::Decided(decision) => return Ok(decision),
                Attempt::Conflict if attempt >= self.retry.max_attempts => {
                    tracing::warn!(client_id, attempt, "bucket commit conflict; giving up");
                    return Err(Error::ConcurrentModification {
                        client_id: client_id.to_owned(),
                        attempts: attempt,
                    });
                }
                Attempt::Conflict => {
                    let delay = self.retry.backoff(attempt);
                    tracing::debug!(client_id, attempt, ?delay, "bucket commit conflict; retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Returns the refilled state of the client's bucket without consuming a token or writing.
    ///
    /// Returns `None` if the client has no bucket yet.
    pub async fn status(&self, client_id: &str) -> Result<Option<Decision>> {
        let keys = self.keys(client_id);
        let watched = self.timed(self.store.watch(&keys)).await?;
        let Some(bucket) = watched.bucket(&keys)? else {
            return Ok(None);
        };

        let policy = bucket.policy.unwrap_or(self.policy);
        let tokens = bucket.refilled(self.time_source.now_millis(), policy);
        Ok(Some(decision(tokens > 0, tokens, policy)))
    }

    /// Stored token count of `client_id`, without refill.
    pub async fn tokens(&self, client_id: &str) -> Result<Option<u64>> {
        Ok(self.stored(client_id).await?.map(|bucket| bucket.tokens))
    }

    /// Stored time of the last update of `client_id` in milliseconds.
    pub async fn last_update(&self, client_id: &str) -> Result<Option<u64>> {
        Ok(self.stored(client_id).await?.map(|bucket| bucket.last_update_ms))
    }

    /// Replaces the client's bucket with a full one using `policy`.
    ///
    /// The policy is persisted with the bucket so that every process applies it.
    /// Not retried on failure.
    pub async fn reset(&self, client_id: &str, policy: BucketPolicy) -> Result<()> {
        policy.validate()?;
        let keys = self.keys(client_id);
        let bucket = StoredBucket {
            tokens: policy.capacity,
            last_update_ms: self.time_source.now_millis(),
            policy: Some(policy),
        };
        self.timed(self.store.put(&keys, &bucket)).await
    }

    /// Checks that the shared store is reachable within the operation timeout.
    pub async fn ping(&self) -> Result<()> {
        self.timed(self.store.ping()).await
    }

    async fn stored(&self, client_id: &str) -> Result<Option<StoredBucket>> {
        let keys = self.keys(client_id);
        self.timed(self.store.watch(&keys))
            .await?
            .bucket(&keys)
    }

    async fn try_check(&self, keys: &BucketKeys) -> Result<Attempt> {
        let watched = self.timed(self.store.watch(keys)).await?;
        let now = self.time_source.now_millis();

        let policy = watched.policy(keys)?.unwrap_or(self.policy);
        let Some(bucket) = watched.bucket(keys)? else {
            let tokens = policy.capacity.saturating_sub(1);
            return self.commit(keys, &watched, tokens, now, policy).await;
        };

        let refilled = bucket.refilled(now, policy);
        if refilled == 0 {
            return Ok(Attempt::Decided(decision(false, 0, policy)));
        }

        let last_update_ms = now.max(bucket.last_update_ms);
        self.commit(keys, &watched, refilled - 1, last_update_ms, policy).await
    }

    async fn commit(
        &self,
        keys: &BucketKeys,
        watched: &Watched,
        tokens: u64,
        last_update_ms: u64,
        policy: BucketPolicy
    ) -> Result<Attempt> {
        let committed = self
            .timed(self.store.commit(keys, watched, tokens, last_update_ms))
            .await?;

        Ok(if committed {
            Attempt::Decided(decision(true, tokens, policy))
        } else {
            Attempt::Conflict
        })
    }

    async fn timed<R>(&self, op: impl Future<Output = Result<R>>) -> Result<R> {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.op_timeout)),
        }
    }
}

impl<S: SharedStore, T: TimeSource> BucketStore for DistributedBucketStore<S, T> {
    async fn check(&self, client_id: &str) -> Result<Decision> {
        DistributedBucketStore::check(self, client_id).await
    }

    async fn status(&self, client_id: &str) -> Result<Option<Decision>> {
        DistributedBucketStore::status(self, client_id).await
    }

    async fn reset(&self, client_id: &str, policy: BucketPolicy) -> Result<()> {
        DistributedBucketStore::reset(self, client_id, policy).await
    }
}

#[inline]
fn decision(allowed: bool, tokens: u64, policy: BucketPolicy) -> Decision {
    Decision {
        allowed,
        current_tokens: tokens,
        capacity: policy.capacity,
        refill_rate: policy.refill_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::ManualTimeSource;
    use std::sync::Arc;

    type Store = DistributedBucketStore<MemoryStore, ManualTimeSource>;

    fn store(capacity: u64, refill_rate: u64) -> (Store, MemoryStore, ManualTimeSource) {
        let shared = MemoryStore::new();
        let time = ManualTimeSource::new(1_700_000_000_000);
        let store = DistributedBucketStore::with_time_source(
            shared.clone(),
            BucketPolicy { capacity, refill_rate },
            time.clone()
        )
        .unwrap();
        (store, shared, time)
    }

    #[test]
    fn it_builds_keys_under_prefix() {
        let keys = BucketKeys::new("rate_limiter:", "c1");

        assert_eq!(keys.all(), [
            "rate_limiter:c1:tokens",
            "rate_limiter:c1:last_update",
            "rate_limiter:c1:capacity",
            "rate_limiter:c1:refill_rate",
        ]);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let retry = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(30),
        };

        assert_eq!(retry.backoff(1), Duration::from_millis(5));
        assert_eq!(retry.backoff(2), Duration::from_millis(10));
        assert_eq!(retry.backoff(3), Duration::from_millis(20));
        assert_eq!(retry.backoff(4), Duration::from_millis(30));
        assert_eq!(retry.backoff(40), Duration::from_millis(30));
    }

    #[test]
    fn refill_adds_fractional_seconds() {
        let bucket = StoredBucket { tokens: 0, last_update_ms: 1_000, policy: None };
        let policy = BucketPolicy { capacity: 5, refill_rate: 2 };

        assert_eq!(bucket.refilled(1_499, policy), 0);
        assert_eq!(bucket.refilled(1_500, policy), 1);
        assert_eq!(bucket.refilled(2_000, policy), 2);
        assert_eq!(bucket.refilled(100_000, policy), 5);
        assert_eq!(bucket.refilled(0, policy), 0);
    }

    #[tokio::test]
    async fn it_allows_capacity_then_denies() {
        let (store, _, _) = store(10, 2);

        for expected in (0..10).rev() {
            let decision = store.check("c1").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.current_tokens, expected);
        }

        let decision = store.check("c1").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.current_tokens, 0);
    }

    #[tokio::test]
    async fn it_persists_decimal_entries() {
        let (store, shared, time) = store(5, 2);

        assert!(store.is_allowed("c1").await.unwrap());

        assert_eq!(shared.get("rate_limiter:c1:tokens").as_deref(), Some("4"));
        assert_eq!(
            shared.get("rate_limiter:c1:last_update"),
            Some(time.now_millis().to_string())
        );
        assert_eq!(store.tokens("c1").await.unwrap(), Some(4));
        assert_eq!(store.last_update("c1").await.unwrap(), Some(time.now_millis()));
        assert_eq!(store.tokens("unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn it_refills_partial_seconds() {
        let (store, _, time) = store(5, 2);
        for _ in 0..5 {
            assert!(store.is_allowed("c1").await.unwrap());
        }
        assert!(!store.is_allowed("c1").await.unwrap());

        time.advance(Duration::from_millis(500));

        assert!(store.is_allowed("c1").await.unwrap());
        assert!(!store.is_allowed("c1").await.unwrap());
    }

    #[tokio::test]
    async fn it_refills_whole_seconds() {
        let (store, _, time) = store(5, 2);
        for _ in 0..5 {
            store.check("c1").await.unwrap();
        }

        time.advance(Duration::from_millis(2_000));

        for _ in 0..4 {
            assert!(store.is_allowed("c1").await.unwrap());
        }
        assert!(!store.is_allowed("c1").await.unwrap());
    }

    #[tokio::test]
    async fn denial_does_not_write() {
        let (store, shared, time) = store(1, 1);
        store.check("c1").await.unwrap();
        let written = shared.get("rate_limiter:c1:last_update");

        time.advance(Duration::from_millis(200));
        assert!(!store.is_allowed("c1").await.unwrap());

        assert_eq!(shared.get("rate_limiter:c1:last_update"), written);
    }

    #[tokio::test]
    async fn it_isolates_clients() {
        let (store, _, _) = store(2, 1);
        store.check("a").await.unwrap();
        store.check("a").await.unwrap();
        assert!(!store.is_allowed("a").await.unwrap());

        assert_eq!(store.check("b").await.unwrap().current_tokens, 1);
    }

    #[tokio::test]
    async fn status_does_not_consume() {
        let (store, _, time) = store(5, 2);
        assert!(store.status("c1").await.unwrap().is_none());

        store.check("c1").await.unwrap();
        time.advance(Duration::from_millis(100));

        for _ in 0..3 {
            assert_eq!(store.status("c1").await.unwrap().unwrap().current_tokens, 4);
        }
        assert_eq!(store.tokens("c1").await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn timestamps_never_move_backwards() {
        let (store, _, time) = store(5, 2);
        store.check("c1").await.unwrap();
        let first = store.last_update("c1").await.unwrap().unwrap();

        time.set(first - 10_000);
        assert!(store.is_allowed("c1").await.unwrap());

        assert_eq!(store.last_update("c1").await.unwrap(), Some(first));
        assert_eq!(store.tokens("c1").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn it_retries_lost_commits() {
        let (store, shared, _) = store(5, 2);
        store.check("c1").await.unwrap();

        shared.interfere_with_next_commits(2);

        let decision = store.check("c1").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.current_tokens, 3);
    }

    #[tokio::test]
    async fn it_surfaces_persistent_conflicts() {
        let (store, shared, _) = store(5, 2);
        let store = store.with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        });

        shared.interfere_with_next_commits(3);

        let err = store.check("c1").await.unwrap_err();
        assert_eq!(err, Error::ConcurrentModification { client_id: "c1".into(), attempts: 3 });
    }

    #[tokio::test]
    async fn no_retry_policy_gives_up_after_first_conflict() {
        let (store, shared, _) = store(5, 2);
        let store = store.with_retry_policy(RetryPolicy::no_retry());

        shared.interfere_with_next_commits(1);

        assert!(matches!(
            store.check("c1").await,
            Err(Error::ConcurrentModification { attempts: 1, .. })
        ));
        assert!(store.is_allowed("c1").await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_is_an_error_not_a_denial() {
        let (store, shared, _) = store(5, 2);
        shared.set_available(false);

        let err = store.check("c1").await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert!(store.ping().await.is_err());

        shared.set_available(true);
        assert!(store.is_allowed("c1").await.unwrap());
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let (store, shared, _) = store(5, 2);
        let store = store.with_op_timeout(Duration::from_millis(50));
        shared.set_latency(Duration::from_millis(200));

        let err = store.check("c1").await.unwrap_err();

        assert_eq!(err, Error::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn corrupted_entries_are_reported() {
        let (store, shared, _) = store(5, 2);
        shared.insert("rate_limiter:c1:tokens", "many");
        shared.insert("rate_limiter:c1:last_update", "0");

        let err = store.check("c1").await.unwrap_err();

        assert_eq!(err, Error::CorruptedRecord {
            key: "rate_limiter:c1:tokens".into(),
            value: "many".into(),
        });
    }

    #[tokio::test]
    async fn stored_tokens_above_capacity_are_clamped() {
        let (store, shared, time) = store(5, 2);
        shared.insert("rate_limiter:c1:tokens", "50");
        shared.insert("rate_limiter:c1:last_update", &time.now_millis().to_string());

        let decision = store.check("c1").await.unwrap();

        assert_eq!(decision.current_tokens, 4);
    }

    #[tokio::test]
    async fn reset_persists_policy_for_every_instance() {
        let (first, shared, time) = store(10, 2);
        let second = DistributedBucketStore::with_time_source(
            shared.clone(),
            BucketPolicy { capacity: 10, refill_rate: 2 },
            time.clone()
        )
        .unwrap();

        first.reset("c1", BucketPolicy { capacity: 3, refill_rate: 1 }).await.unwrap();

        for expected in [2, 1, 0] {
            let decision = second.check("c1").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.current_tokens, expected);
            assert_eq!(decision.capacity, 3);
        }
        assert!(!first.is_allowed("c1").await.unwrap());
        assert_eq!(shared.get("rate_limiter:c1:refill_rate").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn it_rejects_invalid_default_policy() {
        let err = DistributedBucketStore::new(
            MemoryStore::new(),
            BucketPolicy { capacity: 0, refill_rate: 1 }
        )
        .unwrap_err();
        assert!(err.is_config_error());

        let err = DistributedBucketStore::with_time_source(
            MemoryStore::new(),
            BucketPolicy { capacity: 5, refill_rate: 0 },
            ManualTimeSource::new(0)
        )
        .unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn lost_state_is_recreated_with_stored_policy() {
        let (store, shared, _) = store(10, 2);
        shared.insert("rate_limiter:c1:capacity", "3");
        shared.insert("rate_limiter:c1:refill_rate", "1");

        let decision = store.check("c1").await.unwrap();

        assert_eq!(decision, Decision { allowed: true, current_tokens: 2, capacity: 3, refill_rate: 1 });
        assert_eq!(shared.get("rate_limiter:c1:tokens").as_deref(), Some("2"));
        assert_eq!(store.status("c1").await.unwrap().map(|status| status.capacity), Some(3));
    }

    #[tokio::test]
    async fn reset_rejects_invalid_policy() {
        let (store, shared, _) = store(10, 2);

        let err = store.reset("c1", BucketPolicy { capacity: 0, refill_rate: 1 }).await.unwrap_err();

        assert!(err.is_config_error());
        assert!(shared.is_empty());
    }

    #[tokio::test]
    async fn custom_prefix_is_used() {
        let (store, shared, _) = store(10, 2);
        let store = store.with_key_prefix("limits/");

        store.check("c1").await.unwrap();

        assert_eq!(shared.get("limits/c1:tokens").as_deref(), Some("9"));
        assert_eq!(store.key_prefix(), "limits/");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_instances_admit_exactly_capacity() {
        let shared = MemoryStore::new();
        let time = ManualTimeSource::new(1_700_000_000_000);
        let retry = RetryPolicy {
            max_attempts: 1_000,
            base_backoff: Duration::from_micros(50),
            max_backoff: Duration::from_millis(1),
        };

        let instances: Vec<_> = (0..4)
            .map(|_| Arc::new(
                DistributedBucketStore::with_time_source(
                    shared.clone(),
                    BucketPolicy { capacity: 20, refill_rate: 1 },
                    time.clone()
                )
                .unwrap()
                .with_retry_policy(retry)
            ))
            .collect();

        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let instance = instances[i % instances.len()].clone();
                tokio::spawn(async move { instance.is_allowed("shared").await.unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 20);
        assert_eq!(instances[0].tokens("shared").await.unwrap(), Some(0));
    }
}
