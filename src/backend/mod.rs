//! Key-value primitives the rollup store is layered on.
//!
//! Two implementations ship with the crate: [`MemoryBackend`], an in-process store,
//! and (with the `redis-backend` feature) `RedisBackend`, which talks to a Redis server.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryBackend;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("WRONGTYPE operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("invalid expire time {0}")]
    InvalidExpireTime(i64),

    #[error("batch returned {got} replies for {expected} operations")]
    BatchLength { expected: usize, got: usize },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "redis-backend")]
    #[error(transparent)]
    Redis(#[from] ::redis::RedisError),
}

/// One read inside a batch. Each variant yields a non-negative integer, or nothing
/// when the key (or field) is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOp {
    /// Integer stored at `key`.
    Get { key: String },
    /// Integer stored in `field` of the hash at `key`.
    HashField { key: String, field: String },
    /// Estimated cardinality of the approximate set at `key`.
    Cardinality { key: String },
    /// Members of the exact set at `key` whose score lies in `[min, max]`.
    ScoreRangeCount { key: String, min: i64, max: i64 },
}

impl ReadOp {
    pub fn key(&self) -> &str {
        match self {
            ReadOp::Get { key }
            | ReadOp::HashField { key, .. }
            | ReadOp::Cardinality { key }
            | ReadOp::ScoreRangeCount { key, .. } => key,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Increments the integer at `key`, creating it at 0 first.
    async fn increment(&self, key: &str) -> Result<i64, BackendError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn increment_hash_field(&self, key: &str, field: &str) -> Result<i64, BackendError>;

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<i64>, BackendError>;

    /// Returns true when the approximate set changed.
    async fn add_to_approximate_set(&self, key: &str, member: &str) -> Result<bool, BackendError>;

    async fn estimate_cardinality(&self, key: &str) -> Result<u64, BackendError>;

    /// Adds `member` with `score`. Returns true when the member is new.
    async fn add_to_exact_set(&self, key: &str, score: i64, member: &str)
        -> Result<bool, BackendError>;

    /// Counts members with a score in `[min, max]`.
    async fn exact_set_cardinality(&self, key: &str, min: i64, max: i64)
        -> Result<u64, BackendError>;

    /// (Re)sets the time to live of `key`. Returns false if the key does not exist.
    async fn expire(&self, key: &str, seconds: i64) -> Result<bool, BackendError>;

    /// Runs every read in one round trip. Replies come back in request order.
    async fn execute_batch(&self, ops: &[ReadOp]) -> Result<Vec<Option<u64>>, BackendError>;
}
