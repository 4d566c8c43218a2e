//! Redis-backed [`SharedStore`].

use std::fmt;
use redis::{aio::ConnectionManager, Client, Script};
use crate::error::{Error, Result};
use super::{BucketKeys, SharedStore, StoredBucket, Watched, ENTRY_COUNT};

/// Compares every watched entry with its expected value (absent as `""`)
/// and writes the new tokens and timestamp only if none changed.
const COMMIT_SCRIPT: &str = r#"
for i = 1, #KEYS do
    local current = redis.call('GET', KEYS[i])
    if current == false then
        current = ''
    end
    if current ~= ARGV[i] then
        return 0
    end
end
redis.call('SET', KEYS[1], ARGV[#KEYS + 1])
redis.call('SET', KEYS[2], ARGV[#KEYS + 2])
return 1
"#;

/// A [`SharedStore`] over a Redis server.
///
/// Uses a single multiplexed connection that reconnects on failure.
/// Because the connection is shared by concurrent checks, `WATCH`/`MULTI`
/// cannot be used; the optimistic commit is a server-side script that
/// compares the watched values before writing.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    commit: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to the Redis server at `url`, e.g. `redis://127.0.0.1:6379`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the URL is invalid or the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("connected to redis");
        Ok(Self::from_connection(conn))
    }

    /// Wraps an already established connection.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn, commit: Script::new(COMMIT_SCRIPT) }
    }
}

impl SharedStore for RedisStore {
    async fn watch(&self, keys: &BucketKeys) -> Result<Watched> {
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys.all()[..])
            .query_async(&mut conn)
            .await?;

        let values: [Option<String>; ENTRY_COUNT] = values
            .try_into()
            .map_err(|values: Vec<_>| Error::StoreUnavailable(
                format!("MGET returned {} values, expected {ENTRY_COUNT}", values.len())
            ))?;
        Ok(Watched::new(values))
    }

    async fn commit(
        &self,
        keys: &BucketKeys,
        watched: &Watched,
        tokens: u64,
        last_update_ms: u64
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.commit.prepare_invoke();
        for key in keys.all() {
            invocation.key(key);
        }
        for expected in watched.values() {
            invocation.arg(expected.as_deref().unwrap_or(""));
        }
        invocation.arg(tokens).arg(last_update_ms);

        let committed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(committed == 1)
    }

    async fn put(&self, keys: &BucketKeys, bucket: &StoredBucket) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(&keys.tokens, bucket.tokens).ignore()
            .set(&keys.last_update, bucket.last_update_ms).ignore();
        match bucket.policy {
            Some(policy) => pipe
                .set(&keys.capacity, policy.capacity).ignore()
                .set(&keys.refill_rate, policy.refill_rate).ignore(),
            None => pipe
                .del(&keys.capacity).ignore()
                .del(&keys.refill_rate).ignore(),
        };

        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
