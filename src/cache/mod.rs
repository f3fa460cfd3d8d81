pub mod keys;
pub mod memory;
pub mod snapshot;

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;

use crate::assembly::types::ItemId;

pub use memory::MemoryCache;
pub use snapshot::{QuestionView, SessionSnapshot, SnapshotStatus};

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("cache payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Best-effort accelerator in front of the store; also hosts the
/// generation lock and learner histories.
#[async_trait]
pub trait ExamCache: Send + Sync {
    async fn get_snapshot(&self, key: &str) -> Result<Option<SessionSnapshot>, CacheError>;

    async fn put_snapshot(&self, key: &str, snapshot: &SessionSnapshot, ttl: Duration) -> Result<(), CacheError>;

    async fn delete_snapshot(&self, key: &str) -> Result<(), CacheError>;

    /// Atomic set-if-absent with expiry. `true` when `token` now owns the lock.
    async fn try_acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Deletes the lock only while `token` still owns it.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError>;

    /// Newest first.
    async fn history(&self, key: &str) -> Result<Vec<ItemId>, CacheError>;

    /// Prepends `ids` (last id ends up first), keeps `capacity` entries and
    /// refreshes the expiry, all in one step.
    async fn push_history(
        &self,
        key: &str,
        ids: &[ItemId],
        capacity: usize,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct RedisCache {
    connection: MultiplexedConnection,
}

impl RedisCache {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        Ok(Self::new(connection))
    }
}

#[async_trait]
impl ExamCache for RedisCache {
    async fn get_snapshot(&self, key: &str) -> Result<Option<SessionSnapshot>, CacheError> {
        let mut conn = self.connection.clone();
        let payload: Option<String> = conn.get(key).await?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    async fn put_snapshot(&self, key: &str, snapshot: &SessionSnapshot, ttl: Duration) -> Result<(), CacheError> {
        let payload = serde_json::to_string(snapshot)?;
        let mut conn = self.connection.clone();
        let ttl_secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, payload, ttl_secs).await?;
        Ok(())
    }

    async fn delete_snapshot(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: u64 = conn.del(key).await?;
        Ok(())
    }

    async fn try_acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn history(&self, key: &str) -> Result<Vec<ItemId>, CacheError> {
        let mut conn = self.connection.clone();
        let ids: Vec<ItemId> = conn.lrange(key, 0, -1).await?;
        Ok(ids)
    }

    async fn push_history(
        &self,
        key: &str,
        ids: &[ItemId],
        capacity: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let stop = capacity.max(1) as isize - 1;
        let _: () = redis::pipe()
            .atomic()
            .lpush(key, ids)
            .ignore()
            .ltrim(key, 0, stop)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
