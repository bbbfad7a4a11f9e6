use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced by the rollup store.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid granularity, catalog, namespace or environment setting.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("granularity `{0}` does not exist")]
    NotFound(String),

    #[error("the {0} strategy requires an identity")]
    MissingIdentity(&'static str),

    /// The timestamp has no bucket or shard edge representable as an `i64`.
    #[error("timestamp {timestamp} cannot be bucketed by granularity `{granularity}`")]
    TimestampOutOfRange { granularity: String, timestamp: i64 },

    #[error("range spans {buckets} buckets, more than the limit of {limit}")]
    RangeTooLarge { buckets: u128, limit: usize },

    /// A backend primitive failed. `key` names the bucket (or the first bucket of a batch).
    #[error("{op} on `{key}` failed: {source}")]
    Backend {
        op: &'static str,
        key: String,
        #[source]
        source: BackendError,
    },

    /// Insert fan-out failed for `granularity` after at least one other granularity was
    /// written. Which ones were written is not reported.
    #[error("partial write: granularity `{granularity}` failed: {source}")]
    PartialWrite {
        granularity: String,
        #[source]
        source: Box<Error>,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn backend(op: &'static str, key: impl Into<String>, source: BackendError) -> Self {
        Error::Backend {
            op,
            key: key.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
