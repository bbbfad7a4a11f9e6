use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use rollust::granularity::{round_timestamp, MINUTE};
use rollust::{
    AggregationStrategy, Backend, BackendError, Catalog, Error, Granularity, MemoryBackend,
    ReadOp, Retention, RollupStore, Sample,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn store_with(strategy: AggregationStrategy) -> (MemoryBackend, RollupStore) {
    init_logging();
    let backend = MemoryBackend::new();
    let store = RollupStore::new(Arc::new(backend.clone()), "ns", Catalog::default(), strategy)
        .expect("valid store");
    (backend, store)
}

fn values(samples: &[Sample]) -> Vec<u64> {
    samples.iter().map(|s| s.value).collect()
}

#[tokio::test]
async fn exact_counter_per_second_scenario() {
    let (_, store) = store_with(AggregationStrategy::ExactCounter);
    for ts in [0, 1, 1, 3] {
        store.insert(ts, None).await.unwrap();
    }

    let samples = store.fetch("1sec", 0, 3).await.unwrap();
    assert_eq!(
        samples,
        vec![
            Sample::new(0, 1),
            Sample::new(1, 2),
            Sample::new(2, 0),
            Sample::new(3, 1),
        ]
    );
}

#[tokio::test]
async fn exact_counter_per_minute_scenario() {
    let (_, store) = store_with(AggregationStrategy::ExactCounter);
    for ts in [0, 1, 1, 3] {
        store.insert(ts, None).await.unwrap();
    }

    let samples = store.fetch("1min", 0, 120).await.unwrap();
    assert_eq!(
        samples,
        vec![Sample::new(0, 4), Sample::new(60, 0), Sample::new(120, 0)]
    );
}

#[tokio::test]
async fn two_events_in_same_bucket_count_twice() {
    let (_, store) = store_with(AggregationStrategy::ExactCounter);
    let mut rng = rand::thread_rng();

    for _ in 0..20 {
        let base = round_timestamp(rng.gen_range(0..10_000_000), MINUTE).unwrap();
        let ts1 = base + rng.gen_range(0..30);
        let ts2 = ts1 + rng.gen_range(1..(MINUTE - (ts1 - base)));
        assert_eq!(ts1 / MINUTE, ts2 / MINUTE);

        let ns_store = RollupStore::new(
            Arc::new(MemoryBackend::new()),
            format!("bucket-{}", base),
            store.catalog().clone(),
            store.strategy(),
        )
        .unwrap();
        ns_store.insert(ts1, None).await.unwrap();
        ns_store.insert(ts2, None).await.unwrap();

        let samples = ns_store.fetch("1min", ts1, ts2).await.unwrap();
        assert_eq!(samples, vec![Sample::new(base, 2)]);
    }
}

#[tokio::test]
async fn fetch_returns_one_sample_per_step() {
    let (_, store) = store_with(AggregationStrategy::ExactCounter);
    let mut rng = rand::thread_rng();

    for granularity in store.catalog().iter() {
        let d = granularity.duration();
        for _ in 0..10 {
            let start = rng.gen_range(-1_000_000..1_000_000);
            let end = start + rng.gen_range(0..50 * d);
            let samples = store.fetch(granularity.name(), start, end).await.unwrap();

            let first = round_timestamp(start, d).unwrap();
            let last = round_timestamp(end, d).unwrap();
            assert_eq!(samples.len() as i64, (last - first) / d + 1);
            assert_eq!(samples[0].timestamp, first);
            assert!(samples.windows(2).all(|w| w[1].timestamp - w[0].timestamp == d));
            assert!(samples.iter().all(|s| s.value == 0));
        }
    }
}

#[tokio::test]
async fn range_inside_one_bucket_yields_single_sample() {
    let (_, store) = store_with(AggregationStrategy::ExactCounter);
    store.insert(3_700, None).await.unwrap();
    let samples = store.fetch("1hour", 3_650, 3_660).await.unwrap();
    assert_eq!(samples, vec![Sample::new(3_600, 1)]);
}

#[tokio::test]
async fn reversed_range_is_empty() {
    let (_, store) = store_with(AggregationStrategy::ExactCounter);
    store.insert(5, None).await.unwrap();
    assert!(store.fetch("1sec", 10, 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_granularity_is_not_found() {
    let (_, store) = store_with(AggregationStrategy::ExactCounter);
    match store.fetch("1week", 0, 10).await {
        Err(Error::NotFound(name)) => assert_eq!(name, "1week"),
        other => panic!("expected NotFound, got {:?}", other),
    }
    // Also for an empty range.
    assert!(matches!(
        store.fetch("1week", 10, 0).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn approximate_unique_counts_identity_once() {
    let (_, store) = store_with(AggregationStrategy::ApproximateUniqueCounter);
    for _ in 0..25 {
        store.insert(42, Some("user:max")).await.unwrap();
    }
    let samples = store.fetch("1sec", 42, 42).await.unwrap();
    assert_eq!(samples, vec![Sample::new(42, 1)]);
}

#[tokio::test]
async fn approximate_unique_scenario() {
    let (_, store) = store_with(AggregationStrategy::ApproximateUniqueCounter);
    for (ts, id) in [
        (0, "user:max"),
        (0, "user:max"),
        (1, "user:hugo"),
        (1, "user:renata"),
        (3, "user:hugo"),
        (61, "user:kc"),
    ] {
        store.insert(ts, Some(id)).await.unwrap();
    }

    let per_second = store.fetch("1sec", 0, 3).await.unwrap();
    assert_eq!(values(&per_second), vec![1, 2, 0, 1]);

    let per_minute = store.fetch("1min", 0, 120).await.unwrap();
    assert_eq!(values(&per_minute), vec![3, 1, 0]);
}

#[tokio::test]
async fn approximate_unique_stays_within_error_bound() {
    let (_, store) = store_with(AggregationStrategy::ApproximateUniqueCounter);
    for i in 0..2_000 {
        store.insert(i % 60, Some(&format!("visitor-{}", i))).await.unwrap();
    }
    let samples = store.fetch("1min", 0, 59).await.unwrap();
    assert_eq!(samples.len(), 1);
    let estimate = samples[0].value as f64;
    assert!((estimate - 2_000.0).abs() <= 2_000.0 * 0.03, "estimate = {}", estimate);
}

#[tokio::test]
async fn exact_unique_ignores_duplicates() {
    let (_, store) = store_with(AggregationStrategy::ExactUniqueCounter);
    let identities: Vec<String> = (0..17).map(|i| format!("user:{}", i)).collect();

    for id in &identities {
        store.insert(100, Some(id)).await.unwrap();
    }
    for id in identities.iter().cycle().take(40) {
        store.insert(100, Some(id)).await.unwrap();
    }

    let samples = store.fetch("1sec", 100, 100).await.unwrap();
    assert_eq!(samples, vec![Sample::new(100, 17)]);
}

#[tokio::test]
async fn exact_unique_separates_buckets_within_a_shard() {
    let (backend, store) = store_with(AggregationStrategy::ExactUniqueCounter);
    for (ts, id) in [
        (0, "user:max"),
        (0, "user:max"),
        (1, "user:hugo"),
        (1, "user:renata"),
        (3, "user:hugo"),
        (61, "user:kc"),
    ] {
        store.insert(ts, Some(id)).await.unwrap();
    }

    // One sorted set per shard and granularity.
    assert_eq!(
        backend.keys(),
        vec!["ns:1day:0", "ns:1hour:0", "ns:1min:0", "ns:1sec:0"]
    );

    let per_second = store.fetch("1sec", 0, 3).await.unwrap();
    assert_eq!(values(&per_second), vec![1, 2, 0, 1]);

    let per_minute = store.fetch("1min", 0, 120).await.unwrap();
    assert_eq!(values(&per_minute), vec![3, 1, 0]);
}

#[tokio::test]
async fn fetch_spans_shard_boundaries() {
    init_logging();
    let backend = MemoryBackend::new();
    let catalog = Catalog::new(vec![Granularity::new(
        "1sec",
        1,
        Retention::Expire(3_600),
        10,
    )])
    .unwrap();
    let store = RollupStore::new(
        Arc::new(backend.clone()),
        "plays",
        catalog,
        AggregationStrategy::ShardedCounter,
    )
    .unwrap();

    for ts in [8, 9, 10, 10, 21] {
        store.insert(ts, None).await.unwrap();
    }
    assert_eq!(
        backend.keys(),
        vec!["plays:1sec:0", "plays:1sec:10", "plays:1sec:20"]
    );

    let samples = store.fetch("1sec", 8, 11).await.unwrap();
    assert_eq!(values(&samples), vec![1, 1, 2, 0]);
}

#[tokio::test]
async fn custom_catalog_replaces_default() {
    init_logging();
    let catalog = Catalog::new(vec![Granularity::new(
        "5min",
        5 * MINUTE,
        Retention::Forever,
        5 * MINUTE,
    )])
    .unwrap();
    let store = RollupStore::new(
        Arc::new(MemoryBackend::new()),
        "custom",
        catalog,
        AggregationStrategy::ExactCounter,
    )
    .unwrap();

    store.insert(299, None).await.unwrap();
    store.insert(300, None).await.unwrap();
    assert_eq!(
        store.fetch("5min", 0, 300).await.unwrap(),
        vec![Sample::new(0, 1), Sample::new(300, 1)]
    );
    assert!(matches!(store.fetch("1sec", 0, 1).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn concurrent_inserts_are_all_counted() {
    let (_, store) = store_with(AggregationStrategy::ExactCounter);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for ts in 0..50 {
                store.insert(ts, None).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let samples = store.fetch("1min", 0, 0).await.unwrap();
    assert_eq!(samples, vec![Sample::new(0, 400)]);
}

/// Delegates to a memory backend but fails writes to keys containing `poisoned`,
/// and can delay every call.
struct FaultyBackend {
    inner: MemoryBackend,
    poisoned: &'static str,
    delay: Option<Duration>,
    batches: AtomicUsize,
}

impl FaultyBackend {
    fn new(poisoned: &'static str) -> Self {
        FaultyBackend {
            inner: MemoryBackend::new(),
            poisoned,
            delay: None,
            batches: AtomicUsize::new(0),
        }
    }

    async fn check(&self, key: &str) -> Result<(), BackendError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if !self.poisoned.is_empty() && key.contains(self.poisoned) {
            return Err(BackendError::Unavailable(format!("refusing {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FaultyBackend {
    async fn increment(&self, key: &str) -> Result<i64, BackendError> {
        self.check(key).await?;
        self.inner.increment(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.inner.get(key).await
    }

    async fn increment_hash_field(&self, key: &str, field: &str) -> Result<i64, BackendError> {
        self.check(key).await?;
        self.inner.increment_hash_field(key, field).await
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<i64>, BackendError> {
        self.inner.get_hash_field(key, field).await
    }

    async fn add_to_approximate_set(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        self.check(key).await?;
        self.inner.add_to_approximate_set(key, member).await
    }

    async fn estimate_cardinality(&self, key: &str) -> Result<u64, BackendError> {
        self.inner.estimate_cardinality(key).await
    }

    async fn add_to_exact_set(
        &self,
        key: &str,
        score: i64,
        member: &str,
    ) -> Result<bool, BackendError> {
        self.check(key).await?;
        self.inner.add_to_exact_set(key, score, member).await
    }

    async fn exact_set_cardinality(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<u64, BackendError> {
        self.inner.exact_set_cardinality(key, min, max).await
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<bool, BackendError> {
        self.inner.expire(key, seconds).await
    }

    async fn execute_batch(&self, ops: &[ReadOp]) -> Result<Vec<Option<u64>>, BackendError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.execute_batch(ops).await
    }
}

#[tokio::test]
async fn failing_granularity_reports_partial_write() {
    init_logging();
    let backend = Arc::new(FaultyBackend::new(":1hour:"));
    let store = RollupStore::new(
        backend.clone(),
        "ns",
        Catalog::default(),
        AggregationStrategy::ExactCounter,
    )
    .unwrap();

    let err = store.insert(7, None).await.unwrap_err();
    match &err {
        Error::PartialWrite { granularity, source } => {
            assert_eq!(granularity, "1hour");
            assert!(matches!(
                source.as_ref(),
                Error::Backend { op: "increment", key, .. } if key == "ns:1hour:0"
            ));
        }
        other => panic!("expected PartialWrite, got {:?}", other),
    }

    // The other granularities were not rolled back.
    assert_eq!(store.fetch("1sec", 7, 7).await.unwrap(), vec![Sample::new(7, 1)]);
    assert_eq!(store.fetch("1day", 7, 7).await.unwrap(), vec![Sample::new(0, 1)]);
    assert_eq!(store.fetch("1hour", 7, 7).await.unwrap(), vec![Sample::new(0, 0)]);
}

#[tokio::test]
async fn failure_in_every_granularity_is_plain_backend_error() {
    init_logging();
    let store = RollupStore::new(
        Arc::new(FaultyBackend::new("ns:")),
        "ns",
        Catalog::default(),
        AggregationStrategy::ApproximateUniqueCounter,
    )
    .unwrap();

    let err = store.insert(7, Some("user:max")).await.unwrap_err();
    assert!(matches!(err, Error::Backend { op: "add_to_approximate_set", .. }), "{:?}", err);
}

#[tokio::test]
async fn fetch_uses_exactly_one_batch() {
    init_logging();
    let backend = Arc::new(FaultyBackend::new(""));
    let store = RollupStore::new(
        backend.clone(),
        "ns",
        Catalog::default(),
        AggregationStrategy::ShardedCounter,
    )
    .unwrap();

    let samples = store.fetch("1sec", 0, 999).await.unwrap();
    assert_eq!(samples.len(), 1_000);
    assert_eq!(backend.batches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_backend_times_out() {
    init_logging();
    let mut backend = FaultyBackend::new("");
    backend.delay = Some(Duration::from_millis(300));
    let store = RollupStore::new(
        Arc::new(backend),
        "ns",
        Catalog::default(),
        AggregationStrategy::ExactCounter,
    )
    .unwrap()
    .with_timeout(Duration::from_millis(20));

    assert!(matches!(store.insert(1, None).await, Err(Error::Timeout(_))));
    assert!(matches!(store.fetch("1sec", 0, 5).await, Err(Error::Timeout(_))));
}
