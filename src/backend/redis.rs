//! Backend over a Redis server, using one multiplexed async connection.
//!
//! Reads issued through [`Backend::execute_batch`] go out as a single pipeline, so a
//! fetch costs one round trip no matter how many buckets it spans.

use async_trait::async_trait;
use log::info;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

use super::{Backend, BackendError, ReadOp};

#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("connected to redis backend");
        Ok(RedisBackend { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        RedisBackend { conn }
    }

    /// Deletes every key in the selected database.
    pub async fn flush_db(&self) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn increment(&self, key: &str) -> Result<i64, BackendError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn increment_hash_field(&self, key: &str, field: &str) -> Result<i64, BackendError> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, 1).await?)
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<i64>, BackendError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn add_to_approximate_set(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        Ok(conn.pfadd(key, member).await?)
    }

    async fn estimate_cardinality(&self, key: &str) -> Result<u64, BackendError> {
        let mut conn = self.conn.clone();
        Ok(conn.pfcount(key).await?)
    }

    async fn add_to_exact_set(
        &self,
        key: &str,
        score: i64,
        member: &str,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        Ok(conn.zadd(key, member, score).await?)
    }

    async fn exact_set_cardinality(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<u64, BackendError> {
        let mut conn = self.conn.clone();
        Ok(conn.zcount(key, min, max).await?)
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        Ok(conn.expire(key, seconds).await?)
    }

    async fn execute_batch(&self, ops: &[ReadOp]) -> Result<Vec<Option<u64>>, BackendError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for op in ops {
            match op {
                ReadOp::Get { key } => pipe.get(key),
                ReadOp::HashField { key, field } => pipe.hget(key, field),
                ReadOp::Cardinality { key } => pipe.pfcount(key),
                ReadOp::ScoreRangeCount { key, min, max } => pipe.zcount(key, *min, *max),
            };
        }

        let mut conn = self.conn.clone();
        let replies: Vec<Option<u64>> = pipe.query_async(&mut conn).await?;
        if replies.len() != ops.len() {
            return Err(BackendError::BatchLength {
                expected: ops.len(),
                got: replies.len(),
            });
        }
        Ok(replies)
    }
}
