//! Uniform rate limiter facade over any [`BucketStore`].

use std::sync::Arc;
use crate::error::Result;
use super::{
    distributed::{DistributedBucketStore, SharedStore},
    BucketPolicy,
    BucketStore,
    Decision,
    LocalBucketStore,
    SystemTimeSource,
};

/// A token-bucket rate limiter.
///
/// Delegates every call to the configured [`BucketStore`] and has no state
/// of its own; cloning it is cheap and clones share the same store.
///
/// # Example
/// ```no_run
/// use tokengate::{BucketPolicy, RateLimiter};
///
/// # async fn run() -> tokengate::Result<()> {
/// let limiter = RateLimiter::local(BucketPolicy::default())?;
///
/// let decision = limiter.check("client-1").await?;
/// if !decision.allowed {
///     // reject the request
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter<S> {
    store: Arc<S>,
}

impl<S> Clone for RateLimiter<S> {
    #[inline]
    fn clone(&self) -> Self {
        Self { store: self.store.clone() }
    }
}

impl RateLimiter<LocalBucketStore> {
    /// Creates a rate limiter backed by an in-process store using the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`](crate::Error::InvalidConfiguration)
    /// if the capacity or refill rate of `policy` is zero.
    #[inline]
    pub fn local(policy: BucketPolicy) -> Result<Self> {
        LocalBucketStore::new(policy).map(Self::new)
    }
}

impl<S: SharedStore> RateLimiter<DistributedBucketStore<S>> {
    /// Creates a rate limiter backed by a shared store using the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`](crate::Error::InvalidConfiguration)
    /// if the capacity or refill rate of `policy` is zero.
    #[inline]
    pub fn distributed(store: S, policy: BucketPolicy) -> Result<Self> {
        DistributedBucketStore::<S, SystemTimeSource>::new(store, policy).map(Self::new)
    }
}

impl<S: BucketStore> RateLimiter<S> {
    /// Creates a rate limiter over `store`.
    #[inline]
    pub fn new(store: S) -> Self {
        Self { store: Arc::new(store) }
    }

    /// Returns the underlying store.
    #[inline(always)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Checks whether a request from `client_id` is admitted, consuming a token if so.
    ///
    /// # Errors
    ///
    /// Propagates store failures; a denied request is `Ok` with `allowed == false`.
    pub async fn check(&self, client_id: &str) -> Result<Decision> {
        match self.store.check(client_id).await {
            Ok(decision) => {
                tracing::debug!(
                    client_id,
                    allowed = decision.allowed,
                    tokens = decision.current_tokens,
                    "rate limit check"
                );
                Ok(decision)
            }
            Err(err) => {
                tracing::warn!(client_id, "rate limit check failed: {err}");
                Err(err)
            }
        }
    }

    /// Returns the refilled state of the client's bucket without consuming a token.
    ///
    /// Returns `None` if the client has no bucket yet.
    pub async fn status(&self, client_id: &str) -> Result<Option<Decision>> {
        self.store.status(client_id).await
    }

    /// Replaces the client's bucket with a full one using `capacity` and `refill_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`](crate::Error::InvalidConfiguration)
    /// if `capacity` or `refill_rate` is zero, or a store failure.
    pub async fn reset(&self, client_id: &str, capacity: u64, refill_rate: u64) -> Result<()> {
        let policy = BucketPolicy::new(capacity, refill_rate)?;
        self.store.reset(client_id, policy).await?;
        tracing::info!(client_id, capacity, refill_rate, "bucket reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::{distributed::MemoryStore, ManualTimeSource};
    use std::time::Duration;

    #[tokio::test]
    async fn it_checks_through_local_store() {
        let limiter = RateLimiter::local(BucketPolicy { capacity: 2, refill_rate: 1 }).unwrap();

        assert!(limiter.check("c1").await.unwrap().allowed);
        assert!(limiter.check("c1").await.unwrap().allowed);
        assert!(!limiter.check("c1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn it_checks_through_distributed_store() {
        let limiter = RateLimiter::distributed(MemoryStore::new(), BucketPolicy { capacity: 2, refill_rate: 1 }).unwrap();

        assert!(limiter.check("c1").await.unwrap().allowed);
        assert!(limiter.check("c1").await.unwrap().allowed);
        assert!(!limiter.check("c1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn clones_share_store() {
        let limiter = RateLimiter::local(BucketPolicy { capacity: 1, refill_rate: 1 }).unwrap();
        let other = limiter.clone();

        assert!(limiter.check("c1").await.unwrap().allowed);
        assert!(!other.check("c1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn reset_validates_policy() {
        let limiter = RateLimiter::local(BucketPolicy::default()).unwrap();

        let err = limiter.reset("c1", 0, 2).await.unwrap_err();

        assert!(err.is_config_error());
        assert!(limiter.status("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_refills_both_stores() {
        let time = ManualTimeSource::new(0);
        let local = RateLimiter::new(LocalBucketStore::with_time_source(BucketPolicy::default(), time.clone()).unwrap());
        let shared = RateLimiter::new(DistributedBucketStore::with_time_source(
            MemoryStore::new(),
            BucketPolicy::default(),
            time.clone()
        ).unwrap());

        for _ in 0..10 {
            local.check("c1").await.unwrap();
            shared.check("c1").await.unwrap();
        }

        time.advance(Duration::from_millis(10));
        local.reset("c1", 3, 1).await.unwrap();
        shared.reset("c1", 3, 1).await.unwrap();

        for limiter_status in [local.status("c1").await.unwrap(), shared.status("c1").await.unwrap()] {
            let status = limiter_status.unwrap();
            assert_eq!(status.current_tokens, 3);
            assert_eq!(status.capacity, 3);
            assert_eq!(status.refill_rate, 1);
        }
    }

    #[test]
    fn constructors_reject_invalid_policy() {
        let policy = BucketPolicy { capacity: 0, refill_rate: 2 };

        assert!(RateLimiter::local(policy).unwrap_err().is_config_error());
        assert!(RateLimiter::distributed(MemoryStore::new(), policy).unwrap_err().is_config_error());
    }
}
