use std::error::Error as StdError;
use std::sync::Arc;

use log::info;
use rollust::{Backend, Config, MemoryBackend, RollupStore, Sample};

// (timestamp, identity) pairs; the event counters ignore the identity.
const EVENTS: [(i64, &str); 6] = [
    (0, "user:max"),
    (0, "user:max"),
    (1, "user:hugo"),
    (1, "user:renata"),
    (3, "user:hugo"),
    (61, "user:kc"),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn StdError>> {
    env_logger::init();

    let config = Config::from_env()?;
    let backend = connect(&config).await?;
    let store = config.build_store(backend)?;

    let events: &[(i64, &str)] = if store.strategy().requires_identity() {
        &EVENTS
    } else {
        // Event counters replay 0, 1, 1, 3, 61.
        &EVENTS[1..]
    };
    for &(timestamp, identity) in events {
        store.insert(timestamp, Some(identity)).await?;
    }
    info!("inserted {} events into `{}`", events.len(), store.namespace());

    display(&store, "1sec", 0, 3).await?;
    display(&store, "1min", 0, 120).await?;
    Ok(())
}

#[cfg(feature = "redis-backend")]
async fn connect(config: &Config) -> Result<Arc<dyn Backend>, Box<dyn StdError>> {
    use rollust::backend::RedisBackend;

    if let Some(url) = &config.redis_url {
        let backend = RedisBackend::connect(url).await?;
        backend.flush_db().await?;
        return Ok(Arc::new(backend));
    }
    Ok(memory_backend())
}

#[cfg(not(feature = "redis-backend"))]
async fn connect(config: &Config) -> Result<Arc<dyn Backend>, Box<dyn StdError>> {
    if config.redis_url.is_some() {
        return Err("ROLLUST_REDIS_URL is set but the redis-backend feature is disabled".into());
    }
    Ok(memory_backend())
}

fn memory_backend() -> Arc<dyn Backend> {
    let backend = MemoryBackend::new();
    backend.spawn_expiration_task();
    info!("using in-memory backend");
    Arc::new(backend)
}

async fn display(
    store: &RollupStore,
    granularity: &str,
    start: i64,
    end: i64,
) -> Result<(), Box<dyn StdError>> {
    let samples: Vec<Sample> = store.fetch(granularity, start, end).await?;
    println!("result from {}", granularity);
    println!("{:>12} {:>8}", "timestamp", "value");
    for sample in samples {
        println!("{:>12} {:>8}", sample.timestamp, sample.value);
    }
    println!();
    Ok(())
}
