//! Token-bucket abstractions and shared utilities.
//!
//! This module defines the building blocks shared by both bucket stores:
//!
//! - [`BucketRecord`] holds the per-client state and the refill/consume arithmetic.
//! - [`BucketStore`] is the seam both stores implement, so that the
//!   [`RateLimiter`] facade can work with either of them.
//! - [`TimeSource`] drives all time-dependent logic and can be replaced
//!   to allow deterministic testing.
//!
//! ## Stores
//!
//! - [`LocalBucketStore`] keeps every bucket in process memory and serializes
//!   refill + consume per bucket with a dedicated mutex.
//! - [`distributed::DistributedBucketStore`] keeps buckets in a shared
//!   key-value store and coordinates writers with optimistic concurrency.
//!
//! ## Refill
//!
//! There is no background refill task. Tokens are recomputed lazily from
//! the time elapsed since the last update whenever a bucket is checked.

use std::{
    future::Future,
    sync::{Arc, atomic::{AtomicU64, Ordering::*}},
    time::{Duration, SystemTime, UNIX_EPOCH}
};

use crate::error::Result;

pub use bucket::{BucketPolicy, BucketRecord, Decision, RefillMode, DEFAULT_CAPACITY, DEFAULT_REFILL_RATE};
pub use limiter::RateLimiter;
pub use local::LocalBucketStore;

mod bucket;
mod limiter;
mod local;
pub(crate) mod distributed;

pub(crate) const MILLIS_PER_SEC: u64 = 1_000;

/// A store of token buckets keyed by client identifier.
///
/// Implementations must:
///
/// - Be thread-safe
/// - Apply refill and consume as one atomic unit per bucket
/// - Never let concurrent checks of one client create two buckets
///
/// A denied request is reported through [`Decision::allowed`];
/// the `Err` branch is reserved for store failures and invalid input.
pub trait BucketStore: Send + Sync {
    /// Refills the client's bucket and attempts to consume one token.
    ///
    /// Unseen clients get a fresh bucket with the store's default policy.
    fn check(&self, client_id: &str) -> impl Future<Output = Result<Decision>> + Send;

    /// Returns the client's refilled bucket state without consuming a token.
    ///
    /// Returns `None` if the client has no bucket yet.
    fn status(&self, client_id: &str) -> impl Future<Output = Result<Option<Decision>>> + Send;

    /// Replaces the client's bucket with a full one using the given `policy`.
    fn reset(&self, client_id: &str, policy: BucketPolicy) -> impl Future<Output = Result<()>> + Send;
}

/// A source of wall-clock time used by the bucket stores.
///
/// This abstraction allows stores to be decoupled from the system clock,
/// enabling deterministic and fast unit tests.
///
/// Time is expressed in **milliseconds since [`UNIX_EPOCH`]** so that
/// timestamps written by one process are meaningful to another.
pub trait TimeSource: Send + Sync {
    /// Returns the current time in milliseconds.
    fn now_millis(&self) -> u64;
}

/// System wall-clock time source.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    #[inline]
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis().try_into().unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A manually driven time source.
///
/// Clones share the same clock, so a test can keep one handle
/// and advance the time observed by a store.
#[derive(Debug, Default, Clone)]
pub struct ManualTimeSource {
    now_ms: Arc<AtomicU64>,
}

impl ManualTimeSource {
    /// Creates a clock that starts at `start_ms` milliseconds.
    #[inline]
    pub fn new(start_ms: u64) -> Self {
        Self { now_ms: Arc::new(AtomicU64::new(start_ms)) }
    }

    /// Moves the clock forward by `by`.
    #[inline]
    pub fn advance(&self, by: Duration) {
        let by: u64 = by.as_millis().try_into().unwrap_or(u64::MAX);
        self.now_ms.fetch_add(by, AcqRel);
    }

    /// Sets the clock to `now_ms`, which may also move it backwards.
    #[inline]
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Release);
    }
}

impl TimeSource for ManualTimeSource {
    #[inline]
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_time_source_shares_clock_between_clones() {
        let clock = ManualTimeSource::new(1_000);
        let other = clock.clone();

        other.advance(Duration::from_millis(1_500));
        assert_eq!(clock.now_millis(), 2_500);

        clock.set(10);
        assert_eq!(other.now_millis(), 10);
    }

    #[test]
    fn system_time_source_is_after_epoch() {
        // 2020-01-01T00:00:00Z
        assert!(SystemTimeSource.now_millis() > 1_577_836_800_000);
    }
}
