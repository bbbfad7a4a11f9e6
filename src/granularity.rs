//! Time resolutions and the catalog that maps their names to bucketing policy.
//!
//! A granularity says how wide one bucket is, how long a bucket survives after its
//! last write, and how many consecutive buckets share one backend record (the shard
//! span, only used by the sharded strategies).

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Separator between the namespace, granularity name and bucket id in backend keys.
pub const KEY_DELIMITER: char = ':';

pub const SECOND: i64 = 1;
pub const MINUTE: i64 = 60 * SECOND;
pub const HOUR: i64 = 60 * MINUTE;
pub const DAY: i64 = 24 * HOUR;

/// Longest finite retention a granularity may declare. Use [`Retention::Forever`] beyond it.
pub const MAX_RETENTION: i64 = 100 * 365 * DAY;

/// How long a bucket lives after its most recent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Expire this many seconds after the last write.
    Expire(i64),
    Forever,
}

impl Retention {
    pub fn ttl_seconds(&self) -> Option<i64> {
        match self {
            Retention::Expire(secs) => Some(*secs),
            Retention::Forever => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Granularity {
    name: Cow<'static, str>,
    duration: i64,
    retention: Retention,
    shard_span: i64,
}

impl Granularity {
    /// Builds an unchecked granularity. Validation happens when it joins a [`Catalog`].
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        duration: i64,
        retention: Retention,
        shard_span: i64,
    ) -> Self {
        Granularity {
            name: name.into(),
            duration,
            retention,
            shard_span,
        }
    }

    const fn preset(name: &'static str, duration: i64, retention: Retention, shard_span: i64) -> Self {
        Granularity {
            name: Cow::Borrowed(name),
            duration,
            retention,
            shard_span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bucket width in seconds.
    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    /// Seconds covered by one shard record.
    pub fn shard_span(&self) -> i64 {
        self.shard_span
    }

    /// Left edge of the bucket containing `timestamp`.
    pub fn bucket_start(&self, timestamp: i64) -> Result<i64> {
        round_timestamp(timestamp, self.duration).ok_or_else(|| self.out_of_range(timestamp))
    }

    /// Left edge of the shard containing `timestamp`.
    pub fn shard_start(&self, timestamp: i64) -> Result<i64> {
        round_timestamp(timestamp, self.shard_span).ok_or_else(|| self.out_of_range(timestamp))
    }

    fn out_of_range(&self, timestamp: i64) -> Error {
        Error::TimestampOutOfRange {
            granularity: self.name.to_string(),
            timestamp,
        }
    }

    /// Number of buckets co-located in one shard record.
    pub fn buckets_per_shard(&self) -> i64 {
        self.shard_span / self.duration
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("granularity name must not be empty"));
        }
        if self.name.contains(KEY_DELIMITER) {
            return Err(Error::config(format!(
                "granularity name `{}` contains the key delimiter `{}`",
                self.name, KEY_DELIMITER
            )));
        }
        if self.duration <= 0 {
            return Err(Error::config(format!(
                "granularity `{}`: bucket duration must be positive, got {}",
                self.name, self.duration
            )));
        }
        if self.shard_span <= 0 {
            return Err(Error::config(format!(
                "granularity `{}`: shard span must be positive, got {}",
                self.name, self.shard_span
            )));
        }
        if self.shard_span % self.duration != 0 {
            return Err(Error::config(format!(
                "granularity `{}`: shard span {} is not a multiple of bucket duration {}",
                self.name, self.shard_span, self.duration
            )));
        }
        if let Retention::Expire(secs) = self.retention {
            if secs <= 0 || secs > MAX_RETENTION {
                return Err(Error::config(format!(
                    "granularity `{}`: retention must be within 1..={} seconds, got {}",
                    self.name, MAX_RETENTION, secs
                )));
            }
        }
        Ok(())
    }
}

/// Floors `timestamp` to the most recent multiple of `duration`.
///
/// Rounds toward negative infinity so the result stays monotonic across zero.
/// `duration` must be positive; catalogs never hold a granularity where it isn't.
/// Returns `None` when the edge lies below `i64::MIN`.
pub fn round_timestamp(timestamp: i64, duration: i64) -> Option<i64> {
    debug_assert!(duration > 0, "rounding modulus must be positive");
    timestamp.checked_sub(timestamp.rem_euclid(duration))
}

// Shard spans keep each hash/sorted-set record under the backend's compact-encoding
// thresholds (a few hundred entries).
pub const DEFAULT_GRANULARITIES: [Granularity; 4] = [
    // 300 one-second buckets per shard.
    Granularity::preset("1sec", SECOND, Retention::Expire(2 * HOUR), 5 * MINUTE),
    // 480 one-minute buckets per shard.
    Granularity::preset("1min", MINUTE, Retention::Expire(7 * DAY), 8 * HOUR),
    // 240 one-hour buckets per shard.
    Granularity::preset("1hour", HOUR, Retention::Expire(60 * DAY), 10 * DAY),
    Granularity::preset("1day", DAY, Retention::Forever, 30 * DAY),
];

/// Immutable set of granularities shared by every operation of a store.
#[derive(Debug, Clone)]
pub struct Catalog {
    granularities: Arc<[Granularity]>,
}

impl Catalog {
    /// Validates and freezes `granularities`. An empty list yields the default catalog.
    pub fn new(granularities: Vec<Granularity>) -> Result<Self> {
        if granularities.is_empty() {
            return Ok(Self::default());
        }

        let mut seen = HashSet::new();
        for g in &granularities {
            g.validate()?;
            if !seen.insert(g.name()) {
                return Err(Error::config(format!(
                    "granularity `{}` is defined more than once",
                    g.name()
                )));
            }
        }

        Ok(Catalog {
            granularities: granularities.into(),
        })
    }

    pub fn resolve(&self, name: &str) -> Result<&Granularity> {
        self.get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&Granularity> {
        self.granularities.iter().find(|g| g.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Granularity> {
        self.granularities.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.iter().map(Granularity::name).collect()
    }

    pub fn len(&self) -> usize {
        self.granularities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.granularities.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog {
            granularities: DEFAULT_GRANULARITIES.to_vec().into(),
        }
    }
}
