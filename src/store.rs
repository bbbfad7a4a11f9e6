//! Multi-granularity rollup store.
//!
//! `insert` records one event in every granularity of the catalog. The per-granularity
//! writes address disjoint keys, so they run concurrently and are joined before
//! returning. The fan-out is not atomic: a failure in one granularity leaves the
//! others written.
//!
//! `fetch` reads one granularity over a time range with a single batched backend
//! request and returns one sample per bucket, zero-filled where nothing was recorded.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};

use crate::backend::{Backend, BackendError, ReadOp};
use crate::error::{Error, Result};
use crate::granularity::{Catalog, Granularity, KEY_DELIMITER};
use crate::strategy::{AggregationStrategy, WriteOp};

/// Most buckets a single `fetch` may return.
pub const MAX_FETCH_BUCKETS: usize = 100_000;

/// Aggregate for one bucket. `timestamp` is the bucket's left edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub timestamp: i64,
    pub value: u64,
}

impl Sample {
    pub fn new(timestamp: i64, value: u64) -> Self {
        Sample { timestamp, value }
    }
}

#[derive(Clone)]
pub struct RollupStore {
    backend: Arc<dyn Backend>,
    namespace: String,
    catalog: Catalog,
    strategy: AggregationStrategy,
    timeout: Option<Duration>,
}

impl RollupStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        namespace: impl Into<String>,
        catalog: Catalog,
        strategy: AggregationStrategy,
    ) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(Error::config("namespace must not be empty"));
        }
        if namespace.contains(KEY_DELIMITER) {
            return Err(Error::config(format!(
                "namespace `{}` contains the key delimiter `{}`",
                namespace, KEY_DELIMITER
            )));
        }

        info!(
            "rollup store `{}`: {} strategy over granularities {:?}",
            namespace,
            strategy,
            catalog.names()
        );

        Ok(RollupStore {
            backend,
            namespace,
            catalog,
            strategy,
            timeout: None,
        })
    }

    /// Bounds every `insert` and `fetch` by `timeout`. An insert that times out may
    /// have written some granularities already.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn strategy(&self) -> AggregationStrategy {
        self.strategy
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Records one event at `timestamp` (Unix seconds) in every granularity.
    ///
    /// `identity` is required by the unique-counting strategies and ignored by the
    /// event counters. On failure the first error in catalog order is returned; when
    /// other granularities were written it is wrapped in [`Error::PartialWrite`].
    pub async fn insert(&self, timestamp: i64, identity: Option<&str>) -> Result<()> {
        self.within_deadline(self.fan_out(timestamp, identity)).await
    }

    async fn fan_out(&self, timestamp: i64, identity: Option<&str>) -> Result<()> {
        // Planned up front so a missing identity or unbucketable timestamp writes nothing.
        let planned = self
            .catalog
            .iter()
            .map(|g| {
                self.strategy
                    .write_op(&self.namespace, g, timestamp, identity)
                    .map(|op| (g, op))
            })
            .collect::<Result<Vec<_>>>()?;

        let writes = planned
            .iter()
            .map(|(g, op)| self.write_granularity(g, op, timestamp));
        let results = join_all(writes).await;

        let written = results.iter().filter(|r| r.is_ok()).count();
        let first_failure = planned
            .iter()
            .zip(results)
            .find_map(|((g, _), result)| result.err().map(|err| (g, err)));

        match first_failure {
            None => Ok(()),
            Some((_, err)) if written == 0 => Err(err),
            Some((g, err)) => Err(Error::PartialWrite {
                granularity: g.name().to_string(),
                source: Box::new(err),
            }),
        }
    }

    async fn write_granularity(
        &self,
        granularity: &Granularity,
        op: &WriteOp,
        timestamp: i64,
    ) -> Result<()> {
        if let Err(err) = op.apply(self.backend.as_ref()).await {
            warn!("{} on `{}` failed: {}", op.op_name(), op.key(), err);
            return Err(Error::backend(op.op_name(), op.key(), err));
        }

        // Refreshed on every write: retention counts from the most recent event.
        if let Some(ttl) = granularity.retention().ttl_seconds() {
            if let Err(err) = self.backend.expire(op.key(), ttl).await {
                warn!("expire on `{}` failed: {}", op.key(), err);
                return Err(Error::backend("expire", op.key(), err));
            }
        }

        debug!("{} `{}` at {}", op.op_name(), op.key(), timestamp);
        Ok(())
    }

    /// Samples of `granularity` for every bucket from the one containing `start` to the
    /// one containing `end`, inclusive, in ascending order.
    ///
    /// Returns an empty vector when `start > end`, and [`Error::RangeTooLarge`] when the
    /// range covers more than [`MAX_FETCH_BUCKETS`] buckets.
    pub async fn fetch(&self, granularity: &str, start: i64, end: i64) -> Result<Vec<Sample>> {
        self.within_deadline(self.fetch_range(granularity, start, end))
            .await
    }

    async fn fetch_range(&self, name: &str, start: i64, end: i64) -> Result<Vec<Sample>> {
        let granularity = self.catalog.resolve(name)?;
        if start > end {
            return Ok(Vec::new());
        }

        let edges = bucket_edges(granularity, start, end)?;
        let ops = edges
            .iter()
            .map(|&bucket| self.strategy.read_op(&self.namespace, granularity, bucket))
            .collect::<Result<Vec<ReadOp>>>()?;
        let first_key = ops.first().map(|op| op.key().to_string()).unwrap_or_default();

        debug!(
            "fetching {} buckets of `{}` from {}",
            ops.len(),
            name,
            first_key
        );

        let replies = self
            .backend
            .execute_batch(&ops)
            .await
            .map_err(|err| Error::backend("execute_batch", first_key.clone(), err))?;

        if replies.len() != ops.len() {
            return Err(Error::backend(
                "execute_batch",
                first_key,
                BackendError::BatchLength {
                    expected: ops.len(),
                    got: replies.len(),
                },
            ));
        }

        Ok(edges
            .into_iter()
            .zip(replies)
            .map(|(timestamp, value)| Sample::new(timestamp, value.unwrap_or(0)))
            .collect())
    }

    async fn within_deadline<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match self.timeout {
            None => op.await,
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| Error::Timeout(limit))?,
        }
    }
}

/// Left edges of every bucket between the buckets containing `start` and `end`.
pub fn bucket_edges(granularity: &Granularity, start: i64, end: i64) -> Result<Vec<i64>> {
    if start > end {
        return Ok(Vec::new());
    }
    let first = granularity.bucket_start(start)?;
    let last = granularity.bucket_start(end)?;
    let step = granularity.duration();

    // Wide enough for any pair of i64 edges.
    let buckets = (i128::from(last) - i128::from(first)) as u128 / step as u128 + 1;
    if buckets > MAX_FETCH_BUCKETS as u128 {
        return Err(Error::RangeTooLarge {
            buckets,
            limit: MAX_FETCH_BUCKETS,
        });
    }

    // Every edge lies in [first, last], so narrowing back to i64 is lossless.
    let first = i128::from(first);
    let step = i128::from(step);
    Ok((0..buckets as i128)
        .map(|i| (first + i * step) as i64)
        .collect())
}
