//! Tokengate
//!
//! Per-client request admission using the token-bucket algorithm,
//! backed either by process memory or by a shared key-value store.

mod error;
mod rate_limiter;

pub mod config;

pub use error::{Error, Result};
pub use rate_limiter::{
    BucketPolicy,
    BucketRecord,
    BucketStore,
    Decision,
    LocalBucketStore,
    ManualTimeSource,
    RateLimiter,
    RefillMode,
    SystemTimeSource,
    TimeSource,
    DEFAULT_CAPACITY,
    DEFAULT_REFILL_RATE,
};

/// Distributed bucket store and its shared-store backends
pub mod distributed {
    pub use crate::rate_limiter::distributed::{
        BucketKeys,
        DistributedBucketStore,
        MemoryStore,
        RetryPolicy,
        SharedStore,
        StoredBucket,
        Watched,
        DEFAULT_KEY_PREFIX,
        DEFAULT_OP_TIMEOUT,
    };

    #[cfg(feature = "redis")]
    pub use crate::rate_limiter::distributed::RedisStore;
}
