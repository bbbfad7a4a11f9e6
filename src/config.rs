//! Environment-driven configuration.
//!
//! | variable | default |
//! |---|---|
//! | `ROLLUST_NAMESPACE` | `timeseries` |
//! | `ROLLUST_STRATEGY` | `counter` |
//! | `ROLLUST_GRANULARITIES` | the default catalog |
//! | `ROLLUST_TIMEOUT_MS` | no deadline |
//! | `ROLLUST_REDIS_URL` | in-memory backend |
//!
//! `ROLLUST_GRANULARITIES` is a comma-separated list of `name/duration/ttl/shard_span`
//! entries in seconds, with a ttl of `-1` meaning the buckets never expire, e.g.
//! `1sec/1/7200/300,1day/86400/-1/2592000`.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::granularity::{Catalog, Granularity, Retention};
use crate::store::RollupStore;
use crate::strategy::AggregationStrategy;

pub const NAMESPACE_VAR: &str = "ROLLUST_NAMESPACE";
pub const STRATEGY_VAR: &str = "ROLLUST_STRATEGY";
pub const GRANULARITIES_VAR: &str = "ROLLUST_GRANULARITIES";
pub const TIMEOUT_VAR: &str = "ROLLUST_TIMEOUT_MS";
pub const REDIS_URL_VAR: &str = "ROLLUST_REDIS_URL";

const DEFAULT_NAMESPACE: &str = "timeseries";

#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub strategy: AggregationStrategy,
    pub catalog: Catalog,
    pub timeout: Option<Duration>,
    /// Redis server to use; `None` selects the in-memory backend.
    pub redis_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: DEFAULT_NAMESPACE.to_string(),
            strategy: AggregationStrategy::default(),
            catalog: Catalog::default(),
            timeout: None,
            redis_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(namespace) = var(NAMESPACE_VAR) {
            config.namespace = namespace;
        }
        if let Some(strategy) = var(STRATEGY_VAR) {
            config.strategy = strategy.parse()?;
        }
        if let Some(raw) = var(GRANULARITIES_VAR) {
            config.catalog = Catalog::new(parse_granularities(&raw)?)?;
        }
        if let Some(millis) = var(TIMEOUT_VAR) {
            let millis: u64 = millis.parse().map_err(|_| {
                Error::config(format!(
                    "{} must be a whole number of milliseconds, got `{}`",
                    TIMEOUT_VAR, millis
                ))
            })?;
            if millis == 0 {
                return Err(Error::config(format!("{} must be positive", TIMEOUT_VAR)));
            }
            config.timeout = Some(Duration::from_millis(millis));
        }
        config.redis_url = var(REDIS_URL_VAR);

        Ok(config)
    }

    /// Builds a store over `backend` with this configuration.
    pub fn build_store(&self, backend: Arc<dyn Backend>) -> Result<RollupStore> {
        let store = RollupStore::new(
            backend,
            self.namespace.clone(),
            self.catalog.clone(),
            self.strategy,
        )?;
        Ok(match self.timeout {
            Some(timeout) => store.with_timeout(timeout),
            None => store,
        })
    }
}

// Unset and blank are treated alike.
fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses `name/duration/ttl/shard_span[,...]`.
pub fn parse_granularities(raw: &str) -> Result<Vec<Granularity>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_granularity)
        .collect()
}

fn parse_granularity(entry: &str) -> Result<Granularity> {
    let parts: Vec<&str> = entry.split('/').map(str::trim).collect();
    let [name, duration, ttl, shard_span] = parts.as_slice() else {
        return Err(Error::config(format!(
            "granularity `{}` must look like name/duration/ttl/shard_span",
            entry
        )));
    };

    let number = |field: &str, raw: &str| -> Result<i64> {
        raw.parse().map_err(|_| {
            Error::config(format!(
                "granularity `{}`: {} `{}` is not an integer",
                entry, field, raw
            ))
        })
    };

    let retention = match number("ttl", *ttl)? {
        -1 => Retention::Forever,
        secs => Retention::Expire(secs),
    };

    Ok(Granularity::new(
        name.to_string(),
        number("duration", *duration)?,
        retention,
        number("shard span", *shard_span)?,
    ))
}
