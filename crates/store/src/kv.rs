//! Backing key-value store seam.
//!
//! Everything above this module talks to the store through [`Kv`]. The
//! production implementation is [`RedisKv`]; [`MemoryKv`] keeps the same
//! semantics in process for tests and local development.
//!
//! Writes that must land together (a primary record plus its indexes) go
//! through [`Kv::batch`], which Redis executes as a single `MULTI/EXEC`.

mod memory;

pub use memory::MemoryKv;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;

/// A single mutation inside a [`Kv::batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    Del {
        key: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    LPush {
        key: String,
        value: String,
    },
    LRem {
        key: String,
        value: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    Expire {
        key: String,
        secs: i64,
    },
    Set {
        key: String,
        value: String,
    },
    SetEx {
        key: String,
        value: String,
        secs: u64,
    },
}

impl WriteOp {
    /// The key this write targets.
    pub fn key(&self) -> &str {
        match self {
            WriteOp::HSet { key, .. }
            | WriteOp::HDel { key, .. }
            | WriteOp::Del { key }
            | WriteOp::SAdd { key, .. }
            | WriteOp::SRem { key, .. }
            | WriteOp::LPush { key, .. }
            | WriteOp::LRem { key, .. }
            | WriteOp::ZAdd { key, .. }
            | WriteOp::Expire { key, .. }
            | WriteOp::Set { key, .. }
            | WriteOp::SetEx { key, .. } => key,
        }
    }
}

/// Primitive commands used by the data layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Kv: Send + Sync {
    /// Health check - verify backend connectivity.
    async fn ping(&self) -> Result<bool>;

    /// Read a whole hash record. Missing keys yield an empty map.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Read one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a key (returns true if it existed).
    async fn del(&self, key: &str) -> Result<bool>;

    /// `SET key value NX EX ttl`. Returns true when the key was created.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn scard(&self, key: &str) -> Result<u64>;

    /// Full list contents, head first.
    async fn lrange_all(&self, key: &str) -> Result<Vec<String>>;

    /// Remove sorted-set members with score strictly below `max_exclusive`.
    async fn zremrangebyscore_below(&self, key: &str, max_exclusive: f64) -> Result<()>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Lowest score in a sorted set.
    async fn zmin_score(&self, key: &str) -> Result<Option<f64>>;

    /// All keys matching a glob pattern, via cursor scan.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Set `field` to `new` only if it currently equals `expected`.
    /// Returns true when the swap happened.
    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool>;

    /// Apply all writes as one unit.
    async fn batch(&self, ops: Vec<WriteOp>) -> Result<()>;
}

const COMPARE_AND_SET: &str = r"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if current == ARGV[2] then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
  return 1
end
return 0
";

/// Redis implementation of Kv.
#[derive(Clone)]
pub struct RedisKv {
    client: redis::Client,
}

impl RedisKv {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self> {
        Ok(Self::new(redis::Client::open(url)?))
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn ping(&self) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(result == "PONG")
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let deleted: i64 = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let is_member: bool = conn.sismember(key, member).await?;
        Ok(is_member)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = conn.scard(key).await?;
        Ok(count)
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let values: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(values)
    }

    async fn zremrangebyscore_below(&self, key: &str, max_exclusive: f64) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", max_exclusive))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = conn.zcard(key).await?;
        Ok(count)
    }

    async fn zmin_score(&self, key: &str) -> Result<Option<f64>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let oldest: Vec<(String, f64)> = conn.zrange_withscores(key, 0, 0).await?;
        Ok(oldest.first().map(|(_, score)| *score))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let swapped: i64 = redis::Script::new(COMPARE_AND_SET)
            .key(key)
            .arg(field)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &ops {
            match op {
                WriteOp::HSet { key, fields } => {
                    pipe.hset_multiple(key, fields.as_slice()).ignore();
                }
                WriteOp::HDel { key, fields } => {
                    pipe.hdel(key, fields).ignore();
                }
                WriteOp::Del { key } => {
                    pipe.del(key).ignore();
                }
                WriteOp::SAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                WriteOp::SRem { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                WriteOp::LPush { key, value } => {
                    pipe.lpush(key, value).ignore();
                }
                WriteOp::LRem { key, value } => {
                    pipe.lrem(key, 0, value).ignore();
                }
                WriteOp::ZAdd { key, member, score } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                WriteOp::Expire { key, secs } => {
                    pipe.expire(key, *secs).ignore();
                }
                WriteOp::Set { key, value } => {
                    pipe.set(key, value).ignore();
                }
                WriteOp::SetEx { key, value, secs } => {
                    pipe.set_ex(key, value, *secs).ignore();
                }
            }
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
