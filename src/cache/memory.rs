//! In-process cache backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use super::lock::{rw_read, rw_write};
use super::store::{CacheBatch, CacheOp, CacheStore, StoreError};

const SOURCE: &str = "cache::memory";

#[derive(Debug, Default)]
struct Keyspaces {
    hashes: HashMap<String, BTreeMap<String, Bytes>>,
    sets: HashMap<String, BTreeSet<String>>,
    counters: HashMap<String, HashMap<String, i64>>,
    leases: HashMap<String, Lease>,
}

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: Instant,
}

impl Keyspaces {
    fn apply(&mut self, op: CacheOp) {
        match op {
            CacheOp::HashSet { key, field, value } => {
                self.hashes.entry(key).or_default().insert(field, value);
            }
            CacheOp::HashDelete { key, fields } => {
                if let Some(hash) = self.hashes.get_mut(&key) {
                    for field in &fields {
                        hash.remove(field);
                    }
                    if hash.is_empty() {
                        self.hashes.remove(&key);
                    }
                }
            }
            CacheOp::SetAdd { key, members } => {
                self.sets.entry(key).or_default().extend(members);
            }
            CacheOp::SetRemove { key, members } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    for member in &members {
                        set.remove(member);
                    }
                    if set.is_empty() {
                        self.sets.remove(&key);
                    }
                }
            }
            CacheOp::CounterSet { key, field, value } => {
                self.counters.entry(key).or_default().insert(field, value);
            }
        }
    }
}

/// Cache held in process memory behind a single lock.
///
/// A batch is applied under one write guard, so readers observe either none
/// or all of it.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    inner: RwLock<Keyspaces>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, StoreError> {
        let guard = rw_read(&self.inner, SOURCE, "hget");
        Ok(guard
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hget_many(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<Bytes>>, StoreError> {
        let guard = rw_read(&self.inner, SOURCE, "hget_many");
        let hash = guard.hashes.get(key);
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|h| h.get(field)).cloned())
            .collect())
    }

    async fn hget_all(&self, key: &str) -> Result<BTreeMap<String, Bytes>, StoreError> {
        let guard = rw_read(&self.inner, SOURCE, "hget_all");
        Ok(guard.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let guard = rw_read(&self.inner, SOURCE, "hkeys");
        Ok(guard
            .hashes
            .get(key)
            .map(|hash| hash.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), StoreError> {
        let mut guard = rw_write(&self.inner, SOURCE, "hset");
        guard.apply(CacheOp::HashSet {
            key: key.to_string(),
            field: field.to_string(),
            value,
        });
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<(), StoreError> {
        let mut guard = rw_write(&self.inner, SOURCE, "hdel");
        guard.apply(CacheOp::HashDelete {
            key: key.to_string(),
            fields: fields.to_vec(),
        });
        Ok(())
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        let mut guard = rw_write(&self.inner, SOURCE, "sadd");
        guard.apply(CacheOp::SetAdd {
            key: key.to_string(),
            members: members.to_vec(),
        });
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let guard = rw_read(&self.inner, SOURCE, "smembers");
        Ok(guard
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sdiff(&self, key: &str, minus: &str) -> Result<Vec<String>, StoreError> {
        let guard = rw_read(&self.inner, SOURCE, "sdiff");
        let Some(base) = guard.sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match guard.sets.get(minus) {
            Some(excluded) => base.difference(excluded).cloned().collect(),
            None => base.iter().cloned().collect(),
        })
    }

    async fn counter_get(&self, key: &str, field: &str) -> Result<Option<i64>, StoreError> {
        let guard = rw_read(&self.inner, SOURCE, "counter_get");
        Ok(guard
            .counters
            .get(key)
            .and_then(|counters| counters.get(field))
            .copied())
    }

    async fn counter_get_many(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<i64>>, StoreError> {
        let guard = rw_read(&self.inner, SOURCE, "counter_get_many");
        let counters = guard.counters.get(key);
        Ok(fields
            .iter()
            .map(|field| counters.and_then(|c| c.get(field)).copied())
            .collect())
    }

    async fn counter_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut guard = rw_write(&self.inner, SOURCE, "counter_incr");
        let slot = guard
            .counters
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert(0);
        *slot = slot
            .checked_add(delta)
            .ok_or_else(|| StoreError::backend(format!("counter `{key}.{field}` overflow")))?;
        Ok(*slot)
    }

    async fn exec(&self, batch: CacheBatch) -> Result<(), StoreError> {
        let mut guard = rw_write(&self.inner, SOURCE, "exec");
        for op in batch.into_ops() {
            guard.apply(op);
        }
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut guard = rw_write(&self.inner, SOURCE, "try_acquire_lease");
        let now = Instant::now();
        if guard
            .leases
            .get(key)
            .is_some_and(|lease| lease.expires_at > now)
        {
            return Ok(false);
        }
        guard.leases.insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, key: &str, token: &str) -> Result<(), StoreError> {
        let mut guard = rw_write(&self.inner, SOURCE, "release_lease");
        if guard
            .leases
            .get(key)
            .is_some_and(|lease| lease.token == token)
        {
            guard.leases.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn batch_applies_every_operation() {
        let store = MemoryCacheStore::new();
        let mut batch = CacheBatch::new();
        batch.hset("h", "a", vec![1u8]);
        batch.hset("h", "b", vec![2u8]);
        batch.sadd("s", "a");
        batch.counter_set("c", "a", 9);
        store.exec(batch).await.expect("exec");

        assert_eq!(store.hkeys("h").await.expect("hkeys"), ids(&["a", "b"]));
        assert_eq!(store.smembers("s").await.expect("smembers"), ids(&["a"]));
        assert_eq!(store.counter_get("c", "a").await.expect("counter"), Some(9));
    }

    #[tokio::test]
    async fn sdiff_excludes_members_of_second_set() {
        let store = MemoryCacheStore::new();
        store.sadd("plans", &ids(&["1", "2", "3"])).await.expect("sadd");
        store.sadd("user", &ids(&["2"])).await.expect("sadd");

        assert_eq!(
            store.sdiff("plans", "user").await.expect("sdiff"),
            ids(&["1", "3"])
        );
        assert_eq!(
            store.sdiff("plans", "missing").await.expect("sdiff"),
            ids(&["1", "2", "3"])
        );
        assert!(store.sdiff("missing", "plans").await.expect("sdiff").is_empty());
    }

    #[tokio::test]
    async fn counters_start_at_zero_and_accumulate() {
        let store = MemoryCacheStore::new();
        assert_eq!(store.counter_get("c", "1").await.expect("get"), None);
        assert_eq!(store.counter_incr("c", "1", 1).await.expect("incr"), 1);
        assert_eq!(store.counter_incr("c", "1", -3).await.expect("incr"), -2);
        assert_eq!(
            store
                .counter_get_many("c", &ids(&["1", "2"]))
                .await
                .expect("get many"),
            vec![Some(-2), None]
        );
    }

    #[tokio::test]
    async fn hash_reads_preserve_requested_order() {
        let store = MemoryCacheStore::new();
        store
            .hset("h", "x", Bytes::from_static(b"x"))
            .await
            .expect("hset");
        let values = store
            .hget_many("h", &ids(&["y", "x"]))
            .await
            .expect("hget_many");
        assert_eq!(values, vec![None, Some(Bytes::from_static(b"x"))]);

        store.hdel("h", &ids(&["x"])).await.expect("hdel");
        assert!(store.hget("h", "x").await.expect("hget").is_none());
        assert!(store.hget_all("h").await.expect("hget_all").is_empty());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = MemoryCacheStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lease("lock", "a", ttl).await.expect("acquire"));
        assert!(!store.try_acquire_lease("lock", "b", ttl).await.expect("acquire"));

        store.release_lease("lock", "b").await.expect("release");
        assert!(!store.try_acquire_lease("lock", "b", ttl).await.expect("acquire"));

        store.release_lease("lock", "a").await.expect("release");
        assert!(store.try_acquire_lease("lock", "b", ttl).await.expect("acquire"));
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = MemoryCacheStore::new();
        assert!(
            store
                .try_acquire_lease("lock", "a", Duration::ZERO)
                .await
                .expect("acquire")
        );
        assert!(
            store
                .try_acquire_lease("lock", "b", Duration::from_secs(60))
                .await
                .expect("acquire")
        );

        store.release_lease("lock", "a").await.expect("release");
        assert!(
            !store
                .try_acquire_lease("lock", "c", Duration::from_secs(60))
                .await
                .expect("acquire")
        );
    }
}
