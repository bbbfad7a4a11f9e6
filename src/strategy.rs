//! How one event lands in a bucket, and how a bucket is read back.
//!
//! Key format: `<namespace>:<granularity>:<record id>`, where the record id is the
//! bucket's left edge, or the shard's left edge for the sharded strategies. Sharded
//! strategies address the bucket inside the record by its left edge (hash field or
//! sorted-set score).

use std::fmt;
use std::str::FromStr;

use crate::backend::{Backend, BackendError, ReadOp};
use crate::error::{Error, Result};
use crate::granularity::{Granularity, KEY_DELIMITER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregationStrategy {
    /// One integer per bucket, incremented per event.
    #[default]
    ExactCounter,
    /// Event counts as hash fields, one hash per shard.
    ShardedCounter,
    /// One probabilistic set per bucket; counts distinct identities approximately.
    ApproximateUniqueCounter,
    /// One exact sorted set per shard, members `<bucket>:<identity>` scored by bucket.
    ExactUniqueCounter,
}

impl AggregationStrategy {
    pub const ALL: [AggregationStrategy; 4] = [
        AggregationStrategy::ExactCounter,
        AggregationStrategy::ShardedCounter,
        AggregationStrategy::ApproximateUniqueCounter,
        AggregationStrategy::ExactUniqueCounter,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AggregationStrategy::ExactCounter => "counter",
            AggregationStrategy::ShardedCounter => "sharded-counter",
            AggregationStrategy::ApproximateUniqueCounter => "approx-unique",
            AggregationStrategy::ExactUniqueCounter => "exact-unique",
        }
    }

    pub fn requires_identity(&self) -> bool {
        matches!(
            self,
            AggregationStrategy::ApproximateUniqueCounter | AggregationStrategy::ExactUniqueCounter
        )
    }

    /// Whether several buckets share one backend record.
    pub fn is_sharded(&self) -> bool {
        matches!(
            self,
            AggregationStrategy::ShardedCounter | AggregationStrategy::ExactUniqueCounter
        )
    }

    /// Backend key of the record holding the bucket that contains `timestamp`.
    pub fn record_key(
        &self,
        namespace: &str,
        granularity: &Granularity,
        timestamp: i64,
    ) -> Result<String> {
        let id = if self.is_sharded() {
            granularity.shard_start(timestamp)?
        } else {
            granularity.bucket_start(timestamp)?
        };
        Ok(format!(
            "{}{}{}{}{}",
            namespace,
            KEY_DELIMITER,
            granularity.name(),
            KEY_DELIMITER,
            id
        ))
    }

    pub(crate) fn write_op(
        &self,
        namespace: &str,
        granularity: &Granularity,
        timestamp: i64,
        identity: Option<&str>,
    ) -> Result<WriteOp> {
        let key = self.record_key(namespace, granularity, timestamp)?;
        let bucket = granularity.bucket_start(timestamp)?;

        let op = match self {
            AggregationStrategy::ExactCounter => WriteOp::Increment { key },
            AggregationStrategy::ShardedCounter => WriteOp::IncrementHashField {
                key,
                field: bucket.to_string(),
            },
            AggregationStrategy::ApproximateUniqueCounter => WriteOp::AddToApproximateSet {
                key,
                member: self.identity(identity)?.to_string(),
            },
            AggregationStrategy::ExactUniqueCounter => WriteOp::AddToExactSet {
                key,
                score: bucket,
                member: format!("{}{}{}", bucket, KEY_DELIMITER, self.identity(identity)?),
            },
        };
        Ok(op)
    }

    /// Read for the bucket whose left edge is `bucket`.
    pub(crate) fn read_op(
        &self,
        namespace: &str,
        granularity: &Granularity,
        bucket: i64,
    ) -> Result<ReadOp> {
        let key = self.record_key(namespace, granularity, bucket)?;
        let op = match self {
            AggregationStrategy::ExactCounter => ReadOp::Get { key },
            AggregationStrategy::ShardedCounter => ReadOp::HashField {
                key,
                field: bucket.to_string(),
            },
            AggregationStrategy::ApproximateUniqueCounter => ReadOp::Cardinality { key },
            AggregationStrategy::ExactUniqueCounter => ReadOp::ScoreRangeCount {
                key,
                min: bucket,
                max: bucket,
            },
        };
        Ok(op)
    }

    fn identity<'a>(&self, identity: Option<&'a str>) -> Result<&'a str> {
        identity.ok_or(Error::MissingIdentity(self.name()))
    }
}

impl fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggregationStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.name() == wanted)
            .ok_or_else(|| {
                Error::config(format!(
                    "unknown aggregation strategy `{}` (expected one of: counter, sharded-counter, approx-unique, exact-unique)",
                    s
                ))
            })
    }
}

/// A single backend write planned for one granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriteOp {
    Increment { key: String },
    IncrementHashField { key: String, field: String },
    AddToApproximateSet { key: String, member: String },
    AddToExactSet { key: String, score: i64, member: String },
}

impl WriteOp {
    pub(crate) fn key(&self) -> &str {
        match self {
            WriteOp::Increment { key }
            | WriteOp::IncrementHashField { key, .. }
            | WriteOp::AddToApproximateSet { key, .. }
            | WriteOp::AddToExactSet { key, .. } => key,
        }
    }

    pub(crate) fn op_name(&self) -> &'static str {
        match self {
            WriteOp::Increment { .. } => "increment",
            WriteOp::IncrementHashField { .. } => "increment_hash_field",
            WriteOp::AddToApproximateSet { .. } => "add_to_approximate_set",
            WriteOp::AddToExactSet { .. } => "add_to_exact_set",
        }
    }

    pub(crate) async fn apply(&self, backend: &dyn Backend) -> std::result::Result<(), BackendError> {
        match self {
            WriteOp::Increment { key } => backend.increment(key).await.map(drop),
            WriteOp::IncrementHashField { key, field } => {
                backend.increment_hash_field(key, field).await.map(drop)
            }
            WriteOp::AddToApproximateSet { key, member } => {
                backend.add_to_approximate_set(key, member).await.map(drop)
            }
            WriteOp::AddToExactSet { key, score, member } => {
                backend.add_to_exact_set(key, *score, member).await.map(drop)
            }
        }
    }
}
