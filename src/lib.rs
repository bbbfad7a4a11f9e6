pub mod backend;
pub mod config;
pub mod error;
pub mod granularity;
pub mod hyperloglog;
pub mod store;
pub mod strategy;

pub use backend::{Backend, BackendError, MemoryBackend, ReadOp};
pub use config::Config;
pub use error::{Error, Result};
pub use granularity::{Catalog, Granularity, Retention, DEFAULT_GRANULARITIES, MAX_RETENTION};
pub use store::{RollupStore, Sample, MAX_FETCH_BUCKETS};
pub use strategy::AggregationStrategy;
