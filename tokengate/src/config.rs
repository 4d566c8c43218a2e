//! Serializable rate limiter configuration

use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::{
    error::{Error, Result},
    rate_limiter::distributed::{RetryPolicy, DEFAULT_KEY_PREFIX, DEFAULT_OP_TIMEOUT},
    BucketPolicy,
    RefillMode,
    DEFAULT_CAPACITY,
    DEFAULT_REFILL_RATE,
};

/// Rate limiting algorithms that can be named in a configuration.
///
/// Only [`Algorithm::TokenBucket`] is implemented; selecting any other
/// variant fails validation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algorithm {
    /// Token bucket with lazy refill
    #[default]
    TokenBucket,

    /// Leaky bucket. Not implemented.
    LeakyBucket,

    /// Sliding window. Not implemented.
    SlidingWindow,
}

impl Algorithm {
    /// Returns `true` if requests can be limited with this algorithm.
    #[inline]
    pub fn is_implemented(&self) -> bool {
        matches!(self, Algorithm::TokenBucket)
    }

    /// Fails with [`Error::InvalidConfiguration`] unless the algorithm is implemented.
    pub fn ensure_implemented(&self) -> Result<()> {
        match self {
            Algorithm::TokenBucket => Ok(()),
            Algorithm::LeakyBucket => Err(Error::InvalidConfiguration("leaky bucket algorithm is not implemented")),
            Algorithm::SlidingWindow => Err(Error::InvalidConfiguration("sliding window algorithm is not implemented")),
        }
    }
}

/// Per-client reconfiguration request.
///
/// Only the token-bucket fields are honored; `window_size_ms` is
/// accepted for compatibility and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfig {
    /// Client whose bucket is replaced
    pub client_id: String,

    /// Algorithm to use
    ///
    /// Default: `TOKEN_BUCKET`
    #[serde(default)]
    pub algorithm: Algorithm,

    /// New bucket capacity
    pub capacity: u64,

    /// New refill rate in tokens per second
    pub refill_rate: u64,

    /// Window length of window-based algorithms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size_ms: Option<u64>,
}

impl RateLimiterConfig {
    /// Validates the request and returns the bucket policy it describes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for an unimplemented algorithm,
    /// an empty client id, or a non-positive capacity or refill rate.
    pub fn policy(&self) -> Result<BucketPolicy> {
        self.algorithm.ensure_implemented()?;
        if self.client_id.is_empty() {
            return Err(Error::InvalidConfiguration("client id must not be empty"));
        }
        BucketPolicy::new(self.capacity, self.refill_rate)
    }
}

/// Retry settings of the distributed store, in serializable form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total number of commit attempts
    ///
    /// Default: `5`
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    ///
    /// Default: `5`
    pub base_backoff_ms: u64,

    /// Upper bound of a single delay in milliseconds
    ///
    /// Default: `100`
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    #[inline]
    fn default() -> Self {
        RetryPolicy::default().into()
    }
}

impl From<RetryPolicy> for RetryConfig {
    #[inline]
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            base_backoff_ms: millis(policy.base_backoff),
            max_backoff_ms: millis(policy.max_backoff),
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    #[inline]
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Connection settings of the Redis-backed store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    /// Server URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,

    /// Prefix of every key
    ///
    /// Default: `rate_limiter:`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Time budget of a single round trip in milliseconds
    ///
    /// Default: `500`
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Retry of lost optimistic commits
    #[serde(default)]
    pub retry: RetryConfig,
}

impl RedisConfig {
    /// Creates settings for `url` with every other value defaulted.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: default_key_prefix(),
            op_timeout_ms: default_op_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }

    /// Time budget of a single round trip.
    #[inline]
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Where bucket state is kept.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In process memory
    #[default]
    Local,

    /// In a Redis server shared by every instance
    Redis(RedisConfig),
}

/// Rate limiter settings.
///
/// # Example
/// ```
/// use tokengate::config::{BackendConfig, LimiterConfig};
///
/// let config: LimiterConfig = serde_json::from_str(r#"{
///     "capacity": 5,
///     "refillRate": 1,
///     "backend": { "type": "redis", "url": "redis://127.0.0.1:6379" }
/// }"#).unwrap();
///
/// assert!(config.validate().is_ok());
/// assert!(matches!(config.backend, BackendConfig::Redis(_)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimiterConfig {
    /// Algorithm to use
    ///
    /// Default: `TOKEN_BUCKET`
    pub algorithm: Algorithm,

    /// Capacity of buckets created on first check
    ///
    /// Default: `10`
    pub capacity: u64,

    /// Refill rate of buckets created on first check
    ///
    /// Default: `2`
    pub refill_rate: u64,

    /// How the local store advances refill timestamps
    ///
    /// Default: `truncate`
    pub refill_mode: RefillMode,

    /// Where bucket state is kept
    ///
    /// Default: `local`
    pub backend: BackendConfig,
}

impl Default for LimiterConfig {
    #[inline]
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            capacity: DEFAULT_CAPACITY,
            refill_rate: DEFAULT_REFILL_RATE,
            refill_mode: RefillMode::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl LimiterConfig {
    /// Default bucket policy described by this configuration.
    #[inline]
    pub fn policy(&self) -> BucketPolicy {
        BucketPolicy {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
        }
    }

    /// Checks that the configuration can be used to build a rate limiter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for an unimplemented algorithm,
    /// a non-positive capacity or refill rate, an empty Redis URL
    /// or a zero operation timeout.
    pub fn validate(&self) -> Result<()> {
        self.algorithm.ensure_implemented()?;
        self.policy().validate()?;

        if let BackendConfig::Redis(redis) = &self.backend {
            if redis.url.trim().is_empty() {
                return Err(Error::InvalidConfiguration("redis url must not be empty"));
            }
            if redis.op_timeout_ms == 0 {
                return Err(Error::InvalidConfiguration("operation timeout must be positive"));
            }
            if redis.retry.max_attempts == 0 {
                return Err(Error::InvalidConfiguration("retry attempts must be positive"));
            }
        }
        Ok(())
    }
}

#[inline]
fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_owned()
}

#[inline]
fn default_op_timeout_ms() -> u64 {
    millis(DEFAULT_OP_TIMEOUT)
}

#[inline]
fn millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
