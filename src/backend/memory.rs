//! In-process backend built on a sharded concurrent map.
//!
//! Expiry is lazy: every access first drops the key if its deadline has passed.
//! [`MemoryBackend::spawn_expiration_task`] additionally samples keys in the
//! background so that keys which are never touched again still get reclaimed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use ordered_float::OrderedFloat;
use rand::seq::IteratorRandom;

use super::{Backend, BackendError, ReadOp};
use crate::hyperloglog::HyperLogLog;

const SWEEP_ROUNDS: usize = 16;

#[derive(Debug, Clone)]
enum StorageValue {
    String(String),
    Hash(HashMap<String, String>),
    SortedSet(SortedSet),
    HyperLogLog(HyperLogLog),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StorageValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: StorageValue) -> Self {
        Entry {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(when) if now >= when)
    }
}

#[derive(Debug, Clone, Default)]
struct SortedSet {
    scores: HashMap<String, OrderedFloat<f64>>,
    by_score: BTreeSet<(OrderedFloat<f64>, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) -> bool {
        let score = OrderedFloat(score);
        match self.scores.insert(member.to_string(), score) {
            Some(previous) => {
                self.by_score.remove(&(previous, member.to_string()));
                self.by_score.insert((score, member.to_string()));
                false
            }
            None => {
                self.by_score.insert((score, member.to_string()));
                true
            }
        }
    }

    fn count(&self, min: f64, max: f64) -> usize {
        if min > max {
            return 0;
        }
        self.by_score
            .range((OrderedFloat(min), String::new())..)
            .take_while(|(score, _)| score.0 <= max)
            .count()
    }
}

#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<DashMap<String, Entry>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend {
            data: Arc::new(DashMap::new()),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.remove_if_expired(key, Instant::now());
        match self.data.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                StorageValue::String(value) => Ok(Some(value.clone())),
                _ => Err(BackendError::WrongType),
            },
        }
    }

    pub fn incr_by(&self, key: &str, delta: i64) -> Result<i64, BackendError> {
        self.remove_if_expired(key, Instant::now());

        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(StorageValue::String("0".to_string())));

        let StorageValue::String(current) = &mut entry.value else {
            return Err(BackendError::WrongType);
        };

        let value: i64 = current.parse().map_err(|_| BackendError::NotAnInteger)?;
        let next = value.checked_add(delta).ok_or(BackendError::NotAnInteger)?;
        *current = next.to_string();
        Ok(next)
    }

    pub fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, BackendError> {
        self.remove_if_expired(key, Instant::now());

        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(StorageValue::Hash(HashMap::new())));

        let StorageValue::Hash(hash) = &mut entry.value else {
            return Err(BackendError::WrongType);
        };

        let current = hash.entry(field.to_string()).or_insert_with(|| "0".to_string());
        let value: i64 = current.parse().map_err(|_| BackendError::NotAnInteger)?;
        let next = value.checked_add(delta).ok_or(BackendError::NotAnInteger)?;
        *current = next.to_string();
        Ok(next)
    }

    pub fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BackendError> {
        self.remove_if_expired(key, Instant::now());
        match self.data.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                StorageValue::Hash(hash) => Ok(hash.get(field).cloned()),
                _ => Err(BackendError::WrongType),
            },
        }
    }

    pub fn pfadd(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        self.remove_if_expired(key, Instant::now());

        let mut created = false;
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| {
            created = true;
            Entry::new(StorageValue::HyperLogLog(HyperLogLog::new()))
        });

        let StorageValue::HyperLogLog(hll) = &mut entry.value else {
            return Err(BackendError::WrongType);
        };
        Ok(hll.insert(member.as_bytes()) || created)
    }

    pub fn pfcount(&self, key: &str) -> Result<u64, BackendError> {
        self.remove_if_expired(key, Instant::now());
        match self.data.get(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                StorageValue::HyperLogLog(hll) => Ok(hll.estimate()),
                _ => Err(BackendError::WrongType),
            },
        }
    }

    pub fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, BackendError> {
        self.remove_if_expired(key, Instant::now());

        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(StorageValue::SortedSet(SortedSet::default())));

        let StorageValue::SortedSet(set) = &mut entry.value else {
            return Err(BackendError::WrongType);
        };
        Ok(set.insert(member, score))
    }

    pub fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, BackendError> {
        self.remove_if_expired(key, Instant::now());
        match self.data.get(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                StorageValue::SortedSet(set) => Ok(set.count(min, max) as u64),
                _ => Err(BackendError::WrongType),
            },
        }
    }

    /// Redis semantics: a non-positive `seconds` deletes the key immediately.
    pub fn expire_seconds(&self, key: &str, seconds: i64) -> Result<bool, BackendError> {
        if seconds <= 0 {
            return Ok(self.data.remove(key).is_some());
        }

        let now = Instant::now();
        let deadline = now
            .checked_add(Duration::from_secs(seconds as u64))
            .ok_or(BackendError::InvalidExpireTime(seconds))?;
        if self.remove_if_expired(key, now) {
            return Ok(false);
        }

        let Some(mut entry) = self.data.get_mut(key) else {
            return Ok(false);
        };
        entry.expires_at = Some(deadline);
        Ok(true)
    }

    /// -2 if the key does not exist, -1 if it never expires, otherwise the remaining
    /// seconds rounded up.
    pub fn ttl_seconds(&self, key: &str) -> i64 {
        let now = Instant::now();
        if self.remove_if_expired(key, now) {
            return -2;
        }

        let Some(entry) = self.data.get(key) else {
            return -2;
        };
        let Some(deadline) = entry.expires_at else {
            return -1;
        };

        let millis = deadline.saturating_duration_since(now).as_millis() as i64;
        (millis + 999) / 1000
    }

    pub fn exists(&self, key: &str) -> bool {
        !self.remove_if_expired(key, Instant::now()) && self.data.contains_key(key)
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush_all(&self) {
        self.data.clear();
    }

    fn read(&self, op: &ReadOp) -> Result<Option<u64>, BackendError> {
        match op {
            ReadOp::Get { key } => self.get_value(key)?.map(|v| parse_count(&v)).transpose(),
            ReadOp::HashField { key, field } => {
                self.hget(key, field)?.map(|v| parse_count(&v)).transpose()
            }
            ReadOp::Cardinality { key } => {
                if !self.exists(key) {
                    return Ok(None);
                }
                self.pfcount(key).map(Some)
            }
            ReadOp::ScoreRangeCount { key, min, max } => {
                if !self.exists(key) {
                    return Ok(None);
                }
                self.zcount(key, *min as f64, *max as f64).map(Some)
            }
        }
    }

    fn remove_if_expired(&self, key: &str, now: Instant) -> bool {
        self.data
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
    }

    /// Drops expired keys from random samples of `sample_size` keys. Sampling repeats
    /// while more than a quarter of a sample was expired, up to `SWEEP_ROUNDS` times.
    /// Returns the number of keys removed.
    pub fn sweep_expired(&self, sample_size: usize) -> usize {
        let mut rng = rand::thread_rng();
        let mut removed = 0;

        for _ in 0..SWEEP_ROUNDS {
            let now = Instant::now();
            let sample: Vec<String> = self
                .data
                .iter()
                .map(|entry| entry.key().clone())
                .choose_multiple(&mut rng, sample_size);
            if sample.is_empty() {
                break;
            }

            let expired = sample
                .iter()
                .filter(|key| self.remove_if_expired(key, now))
                .count();
            removed += expired;
            if expired * 4 <= sample.len() {
                break;
            }
        }
        removed
    }

    /// Runs [`MemoryBackend::sweep_expired`] every 100ms so that keys which are never
    /// touched again still get reclaimed.
    pub fn spawn_expiration_task(&self) -> tokio::task::JoinHandle<()> {
        let backend = self.clone();
        tokio::spawn(async move {
            let sample_size: usize = 20;
            let interval = Duration::from_millis(100);

            loop {
                tokio::time::sleep(interval).await;
                let removed = backend.sweep_expired(sample_size);
                if removed > 0 {
                    debug!("expiration sweep removed {} keys", removed);
                }
            }
        })
    }
}

fn parse_count(raw: &str) -> Result<u64, BackendError> {
    raw.parse().map_err(|_| BackendError::NotAnInteger)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn increment(&self, key: &str) -> Result<i64, BackendError> {
        self.incr_by(key, 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.get_value(key)
    }

    async fn increment_hash_field(&self, key: &str, field: &str) -> Result<i64, BackendError> {
        self.hincr_by(key, field, 1)
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<i64>, BackendError> {
        self.hget(key, field)?
            .map(|v| v.parse().map_err(|_| BackendError::NotAnInteger))
            .transpose()
    }

    async fn add_to_approximate_set(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        self.pfadd(key, member)
    }

    async fn estimate_cardinality(&self, key: &str) -> Result<u64, BackendError> {
        self.pfcount(key)
    }

    async fn add_to_exact_set(
        &self,
        key: &str,
        score: i64,
        member: &str,
    ) -> Result<bool, BackendError> {
        self.zadd(key, score as f64, member)
    }

    async fn exact_set_cardinality(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<u64, BackendError> {
        self.zcount(key, min as f64, max as f64)
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<bool, BackendError> {
        self.expire_seconds(key, seconds)
    }

    async fn execute_batch(&self, ops: &[ReadOp]) -> Result<Vec<Option<u64>>, BackendError> {
        ops.iter().map(|op| self.read(op)).collect()
    }
}
