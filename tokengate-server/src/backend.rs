//! Bucket store selected by configuration

use tokengate::{
    config::{BackendConfig, LimiterConfig},
    distributed::{DistributedBucketStore, RedisStore},
    BucketPolicy,
    BucketStore,
    Decision,
    LocalBucketStore,
    Result,
};

/// The bucket store backing the server's rate limiter.
#[derive(Debug)]
pub enum Backend {
    /// Buckets in process memory
    Local(LocalBucketStore),

    /// Buckets in a Redis server
    Redis(DistributedBucketStore<RedisStore>),
}

impl Backend {
    /// Builds the store described by `config`, connecting to Redis if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`](tokengate::Error::InvalidConfiguration)
    /// if `config` does not validate, or a store error if Redis cannot be reached.
    pub async fn from_config(config: &LimiterConfig) -> Result<Self> {
        config.validate()?;

        match &config.backend {
            BackendConfig::Local => {
                let store = LocalBucketStore::new(config.policy())?
                    .with_refill_mode(config.refill_mode);
                Ok(Self::Local(store))
            }
            BackendConfig::Redis(redis) => {
                let shared = RedisStore::connect(&redis.url).await?;
                let store = DistributedBucketStore::new(shared, config.policy())?
                    .with_key_prefix(redis.key_prefix.clone())
                    .with_op_timeout(redis.op_timeout())
                    .with_retry_policy(redis.retry.into());
                Ok(Self::Redis(store))
            }
        }
    }

    /// Name of the backend kind, as reported by the health endpoint.
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Redis(_) => "redis",
        }
    }

    /// Checks that the backend can serve requests.
    pub async fn ping(&self) -> Result<()> {
        match self {
            Self::Local(_) => Ok(()),
            Self::Redis(store) => store.ping().await,
        }
    }
}

impl BucketStore for Backend {
    async fn check(&self, client_id: &str) -> Result<Decision> {
        match self {
            Self::Local(store) => Ok(store.check(client_id)),
            Self::Redis(store) => store.check(client_id).await,
        }
    }

    async fn status(&self, client_id: &str) -> Result<Option<Decision>> {
        match self {
            Self::Local(store) => Ok(store.status(client_id)),
            Self::Redis(store) => store.status(client_id).await,
        }
    }

    async fn reset(&self, client_id: &str, policy: BucketPolicy) -> Result<()> {
        match self {
            Self::Local(store) => store.reset(client_id, policy.capacity, policy.refill_rate),
            Self::Redis(store) => store.reset(client_id, policy).await,
        }
    }
}
