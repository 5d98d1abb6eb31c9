use anyhow::{Context, Result};
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError};

/// Redis client wrapper for managing Redis connections and operations
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
}

impl RedisClient {
    /// Create a new Redis client from a connection URL
    ///
    /// Accepts both plain (redis://) and encrypted (rediss://) URLs. A URL without a password
    /// is allowed but logged, since production deployments should always authenticate.
    pub async fn new(redis_url: &str) -> Result<Self> {
        if !redis_url.contains("://") {
            return Err(anyhow::anyhow!(
                "Invalid Redis URL format. Expected: redis://:password@host:port or rediss://:password@host:port"
            ));
        }

        if !redis_url.contains('@') {
            tracing::warn!("Redis URL does not include a password; use redis://:password@host:port in production");
        }

        let client = Client::open(redis_url).context("Failed to create Redis client from URL")?;

        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager - check REDIS_URL and password")?;

        Ok(Self { manager })
    }

    /// Set a key to a value without expiry
    pub async fn set(&self, key: &str, value: &str) -> Result<(), RedisError> {
        let mut conn = self.manager.clone();
        conn.set(key, value).await
    }

    /// Get a value by key
    pub async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        let mut conn = self.manager.clone();
        conn.get(key).await
    }

    /// Get multiple values by keys, preserving order
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, RedisError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        redis::cmd("MGET").arg(keys).query_async(&mut conn).await
    }

    /// Delete keys, returning how many existed
    pub async fn del(&self, keys: &[String]) -> Result<i64, RedisError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        conn.del(keys).await
    }

    /// Add an element to a sorted set with a score
    pub async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), RedisError> {
        let mut conn = self.manager.clone();
        conn.zadd(key, member, score).await
    }

    /// Members of a sorted set by rank range, lowest score first
    pub async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, RedisError> {
        let mut conn = self.manager.clone();
        conn.zrange(key, start, stop).await
    }

    /// Remove `members` from a sorted set and delete `keys` in one MULTI/EXEC.
    /// Returns how many of `keys` existed.
    pub async fn zrem_and_del(&self, key: &str, members: &[String], keys: &[String]) -> Result<i64, RedisError> {
        if members.is_empty() || keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        let (_, deleted): (i64, i64) = redis::pipe()
            .atomic()
            .zrem(key, members)
            .del(keys)
            .query_async(&mut conn)
            .await?;
        Ok(deleted)
    }

    /// Number of members in a sorted set
    pub async fn zcard(&self, key: &str) -> Result<i64, RedisError> {
        let mut conn = self.manager.clone();
        conn.zcard(key).await
    }

    /// Set a hash field
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), RedisError> {
        let mut conn = self.manager.clone();
        conn.hset(key, field, value).await
    }

    /// Get a hash field
    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, RedisError> {
        let mut conn = self.manager.clone();
        conn.hget(key, field).await
    }

    /// All values of a hash
    pub async fn hvals(&self, key: &str) -> Result<Vec<String>, RedisError> {
        let mut conn = self.manager.clone();
        conn.hvals(key).await
    }

    /// Ping Redis to check if connection is alive
    pub async fn ping(&self) -> Result<bool, RedisError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|resp| resp == "PONG")
    }
}
